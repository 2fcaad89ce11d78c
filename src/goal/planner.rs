//! Goal creation and decomposition.
//!
//! The `GoalPlanner` turns a goal request into a `Goal` in the `planning`
//! state and attaches a validated plan: a step graph plus contingency
//! plans. Plans come either from the built-in template for the goal's type
//! or from the caller. Every plan passes the same validation, so a cyclic
//! or empty step graph never reaches execution.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::{Clock, PlanningStep, RiskLevel, StepGraph, StepType};
use crate::error::{Error, Result};
use crate::goal::{ExecutionApproach, Goal, GoalRequest, GoalStatus, GoalType};
use crate::orchestration::{
    ContingencyAction, ContingencyPlan, ContingencyTrigger, ServiceId,
};
use crate::aplog_debug;

/// Minimum result quality required by the default quality contingency.
pub const DEFAULT_MIN_QUALITY: f64 = 0.6;

/// One step of a decomposition template.
struct TemplateStep {
    id: &'static str,
    name: &'static str,
    step_type: StepType,
    depends_on: &'static [&'static str],
    minutes: u64,
    risk: RiskLevel,
}

const fn template_step(
    id: &'static str,
    name: &'static str,
    step_type: StepType,
    depends_on: &'static [&'static str],
    minutes: u64,
    risk: RiskLevel,
) -> TemplateStep {
    TemplateStep {
        id,
        name,
        step_type,
        depends_on,
        minutes,
        risk,
    }
}

const RESEARCH_TEMPLATE: &[TemplateStep] = &[
    template_step("collect_sources", "Collect sources", StepType::Research, &[], 2, RiskLevel::Low),
    template_step("analyze_findings", "Analyze findings", StepType::Analysis, &["collect_sources"], 2, RiskLevel::Low),
    template_step("verify_claims", "Verify claims", StepType::Verification, &["analyze_findings"], 1, RiskLevel::Low),
    template_step("summarize", "Summarize results", StepType::Coordination, &["verify_claims"], 1, RiskLevel::Low),
];

const AUTOMATION_TEMPLATE: &[TemplateStep] = &[
    template_step("analyze_workflow", "Analyze workflow", StepType::Analysis, &[], 2, RiskLevel::Low),
    template_step("prepare_environment", "Prepare environment", StepType::Action, &[], 1, RiskLevel::Low),
    template_step("run_automation", "Run automation", StepType::Action, &["analyze_workflow", "prepare_environment"], 3, RiskLevel::Medium),
    template_step("verify_outcome", "Verify outcome", StepType::Verification, &["run_automation"], 1, RiskLevel::Low),
];

const OPTIMIZATION_TEMPLATE: &[TemplateStep] = &[
    template_step("measure_baseline", "Measure baseline", StepType::Research, &[], 2, RiskLevel::Low),
    template_step("identify_bottlenecks", "Identify bottlenecks", StepType::Analysis, &["measure_baseline"], 2, RiskLevel::Low),
    template_step("apply_improvements", "Apply improvements", StepType::Action, &["identify_bottlenecks"], 3, RiskLevel::High),
    template_step("verify_improvements", "Verify improvements", StepType::Verification, &["apply_improvements"], 1, RiskLevel::Low),
];

const LEARNING_TEMPLATE: &[TemplateStep] = &[
    template_step("survey_material", "Survey material", StepType::Research, &[], 2, RiskLevel::Low),
    template_step("study_examples", "Study examples", StepType::Research, &[], 2, RiskLevel::Low),
    template_step("practice", "Practice", StepType::Action, &["survey_material", "study_examples"], 3, RiskLevel::Low),
    template_step("assess_progress", "Assess progress", StepType::Verification, &["practice"], 1, RiskLevel::Low),
];

fn template_for(goal_type: GoalType) -> &'static [TemplateStep] {
    match goal_type {
        GoalType::Research => RESEARCH_TEMPLATE,
        GoalType::Automation => AUTOMATION_TEMPLATE,
        GoalType::Optimization => OPTIMIZATION_TEMPLATE,
        GoalType::Learning => LEARNING_TEMPLATE,
    }
}

/// Creates goals and attaches validated plans.
#[derive(Debug, Clone)]
pub struct GoalPlanner {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl GoalPlanner {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Create a goal in the `planning` state.
    ///
    /// # Errors
    /// Returns `Validation` for an empty title.
    pub fn create_goal(&self, request: GoalRequest) -> Result<Goal> {
        if request.title.trim().is_empty() {
            return Err(Error::Validation("goal title must not be empty".to_string()));
        }
        let goal = Goal::new(request, self.clock.now());
        aplog_debug!(
            "planner: created goal {} ({}, {})",
            goal.id.short(),
            goal.goal_type,
            goal.priority
        );
        Ok(goal)
    }

    /// Worker service for a step type: the configured mapping, or a service
    /// named after the type.
    pub fn worker_for(&self, step_type: StepType) -> ServiceId {
        self.config
            .workers
            .get(step_type.as_str())
            .map(|id| ServiceId::from(id.as_str()))
            .unwrap_or_else(|| ServiceId::from(step_type.as_str()))
    }

    /// Attach the built-in plan for the goal's type.
    pub fn decompose(&self, goal: &mut Goal) -> Result<()> {
        let steps = template_for(goal.goal_type)
            .iter()
            .map(|t| {
                let mut step = PlanningStep::new(t.id, t.name, t.step_type)
                    .with_description(&format!("{}: {}", t.name, goal.description))
                    .with_worker(self.worker_for(t.step_type))
                    .with_duration(Duration::from_secs(t.minutes * 60))
                    .with_risk(t.risk)
                    .with_capability(t.step_type.as_str());
                for dep in t.depends_on {
                    step = step.depends_on(*dep);
                }
                step
            })
            .collect();
        let contingencies = self.default_contingencies();
        self.plan_with(goal, steps, contingencies)
    }

    /// Contingency plans attached to every decomposed goal.
    pub fn default_contingencies(&self) -> Vec<ContingencyPlan> {
        vec![
            ContingencyPlan::new(ContingencyTrigger::StepFailure, ContingencyAction::Retry)
                .with_delay(self.config.retry_delay_ms)
                .with_probability(0.3),
            ContingencyPlan::new(
                ContingencyTrigger::ResourceUnavailable,
                ContingencyAction::Alternative,
            )
            .with_probability(0.2),
            ContingencyPlan::new(ContingencyTrigger::TimeConstraint, ContingencyAction::Adapt)
                .with_approach(ExecutionApproach::Parallel)
                .with_max_attempts(1)
                .with_probability(0.25),
            ContingencyPlan::new(
                ContingencyTrigger::QualityThreshold,
                ContingencyAction::Escalate,
            )
            .with_min_quality(DEFAULT_MIN_QUALITY)
            .with_probability(0.15),
        ]
    }

    /// Attach a caller-supplied plan.
    ///
    /// # Errors
    /// - `Validation` if the goal has left the `planning` state
    /// - `GoalPlanningFailure` for an empty plan, a step without a worker,
    ///   duplicate or unknown step ids, a dependency cycle, or an invalid
    ///   contingency plan
    pub fn plan_with(
        &self,
        goal: &mut Goal,
        steps: Vec<PlanningStep>,
        contingencies: Vec<ContingencyPlan>,
    ) -> Result<()> {
        if goal.status != GoalStatus::Planning {
            return Err(Error::Validation(format!(
                "goal {} is {}, plans can only change while planning",
                goal.id.short(),
                goal.status
            )));
        }
        if steps.is_empty() {
            return Err(Error::GoalPlanningFailure(
                "decomposition produced no steps".to_string(),
            ));
        }
        if let Some(step) = steps.iter().find(|s| s.assigned_worker().is_none()) {
            return Err(Error::GoalPlanningFailure(format!(
                "step {} has no worker",
                step.id
            )));
        }
        for plan in &contingencies {
            plan.validate()?;
        }

        let graph = StepGraph::from_steps(steps)?;
        aplog_debug!(
            "planner: goal {} planned with {} steps, {} dependencies, {} contingencies",
            goal.id.short(),
            graph.len(),
            graph.dependency_count(),
            contingencies.len()
        );
        goal.strategy.steps = graph;
        goal.strategy.contingencies = contingencies;
        goal.updated_at = self.clock.now();
        Ok(())
    }
}
