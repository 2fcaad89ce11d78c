use std::sync::Arc;

use clap::{Parser, Subcommand};

use autopilot::config::Config;
use autopilot::core::SystemClock;
use autopilot::goal::{
    select_approach, ExecutionApproach, GoalPlanner, GoalPriority, GoalRequest, GoalType,
};
use autopilot::{aplog, Result};

/// Autopilot - goal orchestration core
#[derive(Parser, Debug)]
#[command(name = "autopilot")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    AUTOPILOT_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.autopilot/autopilot.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Decompose a goal description into a step plan and print it as JSON
    Plan {
        /// What the goal should achieve
        description: String,

        /// research, automation, optimization or learning
        #[arg(long, default_value = "research")]
        goal_type: GoalType,

        /// low, medium, high or critical
        #[arg(long, default_value = "medium")]
        priority: GoalPriority,

        /// Pin the execution approach instead of deriving it from the plan
        #[arg(long)]
        approach: Option<ExecutionApproach>,
    },

    /// Print the effective configuration
    Config {
        /// Write the configuration to ~/.autopilot/autopilot.toml
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    autopilot::log::init(cli.debug);

    match cli.command {
        Command::Plan {
            description,
            goal_type,
            priority,
            approach,
        } => run_plan(description, goal_type, priority, approach),
        Command::Config { init } => run_config(init),
    }
}

fn run_plan(
    description: String,
    goal_type: GoalType,
    priority: GoalPriority,
    approach: Option<ExecutionApproach>,
) -> Result<()> {
    aplog!(
        "Plan command: type={}, priority={}, approach={:?}",
        goal_type,
        priority,
        approach
    );

    let config = Arc::new(Config::load()?);
    let planner = GoalPlanner::new(config, Arc::new(SystemClock));

    let mut request = GoalRequest::new("cli", &description)
        .with_description(&description)
        .with_type(goal_type)
        .with_priority(priority);
    if let Some(approach) = approach {
        request = request.with_approach(approach);
    }

    let mut goal = planner.create_goal(request)?;
    planner.decompose(&mut goal)?;
    if !goal.strategy.approach_pinned {
        goal.strategy.approach = select_approach(&goal);
    }

    println!("{}", serde_json::to_string_pretty(&goal)?);
    Ok(())
}

fn run_config(init: bool) -> Result<()> {
    let config = Config::load()?;
    if init {
        config.save()?;
        println!("Wrote {}", Config::config_path()?.display());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
