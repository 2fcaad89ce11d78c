//! Goal type definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{StepGraph, StepId};
use crate::goal::state::{GoalStatus, StatusHistoryEntry};
use crate::orchestration::{ContingencyPlan, Priority};

/// Unique identifier for a goal.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(pub Uuid);

impl GoalId {
    /// Create a new unique goal identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for GoalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Domain of a goal; selects the decomposition template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    #[default]
    Research,
    Automation,
    Optimization,
    Learning,
}

impl std::fmt::Display for GoalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoalType::Research => write!(f, "research"),
            GoalType::Automation => write!(f, "automation"),
            GoalType::Optimization => write!(f, "optimization"),
            GoalType::Learning => write!(f, "learning"),
        }
    }
}

impl std::str::FromStr for GoalType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "research" => Ok(GoalType::Research),
            "automation" => Ok(GoalType::Automation),
            "optimization" => Ok(GoalType::Optimization),
            "learning" => Ok(GoalType::Learning),
            other => Err(crate::Error::Validation(format!(
                "unknown goal type: {}",
                other
            ))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum GoalPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for GoalPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoalPriority::Low => write!(f, "low"),
            GoalPriority::Medium => write!(f, "medium"),
            GoalPriority::High => write!(f, "high"),
            GoalPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for GoalPriority {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "low" => Ok(GoalPriority::Low),
            "medium" => Ok(GoalPriority::Medium),
            "high" => Ok(GoalPriority::High),
            "critical" => Ok(GoalPriority::Critical),
            other => Err(crate::Error::Validation(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// A goal's step operations are queued at the goal's priority.
impl From<GoalPriority> for Priority {
    fn from(priority: GoalPriority) -> Self {
        match priority {
            GoalPriority::Low => Priority::Low,
            GoalPriority::Medium => Priority::Medium,
            GoalPriority::High => Priority::High,
            GoalPriority::Critical => Priority::Critical,
        }
    }
}

/// How the scheduler drives a goal's steps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionApproach {
    /// One step at a time, in list order.
    #[default]
    Sequential,
    /// Whole ready set per round.
    Parallel,
    /// Capped rounds with optimization rules between them.
    Adaptive,
}

impl std::fmt::Display for ExecutionApproach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionApproach::Sequential => write!(f, "sequential"),
            ExecutionApproach::Parallel => write!(f, "parallel"),
            ExecutionApproach::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for ExecutionApproach {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "sequential" => Ok(ExecutionApproach::Sequential),
            "parallel" => Ok(ExecutionApproach::Parallel),
            "adaptive" => Ok(ExecutionApproach::Adaptive),
            other => Err(crate::Error::Validation(format!(
                "unknown execution approach: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalConstraints {
    pub deadline: Option<DateTime<Utc>>,
    pub resource_limits: BTreeMap<String, f64>,
    /// Goals that must be completed before this one may start.
    pub prerequisites: Vec<GoalId>,
}

/// Approach, steps and contingency plans of a goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoalStrategy {
    pub approach: ExecutionApproach,
    /// Set when the caller chose the approach; execution then keeps it.
    pub approach_pinned: bool,
    pub steps: StepGraph,
    pub contingencies: Vec<ContingencyPlan>,
}

/// Execution progress of a goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    /// Index of the most recently started step in plan order.
    pub current_step: usize,
    /// 0 to 100.
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub performance: BTreeMap<String, f64>,
    /// Step whose unrecovered failure ended execution.
    pub failed_step: Option<StepId>,
}

/// A unit of autonomous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub goal_type: GoalType,
    pub priority: GoalPriority,
    pub status: GoalStatus,
    pub target_outcome: String,
    pub success_criteria: Vec<String>,
    pub constraints: GoalConstraints,
    pub strategy: GoalStrategy,
    pub execution: ExecutionSnapshot,
    /// Set by an `escalate` contingency.
    pub needs_review: bool,
    pub failure_reason: Option<String>,
    pub history: Vec<StatusHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Goal {
    /// Create a goal in the `planning` state with an empty plan.
    pub fn new(request: GoalRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: GoalId::new(),
            owner: request.owner,
            title: request.title,
            description: request.description,
            goal_type: request.goal_type,
            priority: request.priority,
            status: GoalStatus::Planning,
            target_outcome: request.target_outcome,
            success_criteria: request.success_criteria,
            constraints: request.constraints,
            strategy: GoalStrategy {
                approach: request.approach.unwrap_or_default(),
                approach_pinned: request.approach.is_some(),
                ..GoalStrategy::default()
            },
            execution: ExecutionSnapshot::default(),
            needs_review: false,
            failure_reason: None,
            history: vec![StatusHistoryEntry {
                status: GoalStatus::Planning,
                entered_at: now,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Recompute progress from completed steps.
    ///
    /// Progress is `100 * completed / total` rounded down, never decreases,
    /// and stays below 100 until the goal itself completes.
    pub fn refresh_progress(&mut self, now: DateTime<Utc>) -> u8 {
        let total = self.strategy.steps.len();
        if total > 0 && self.status != GoalStatus::Completed {
            let completed = self.strategy.steps.completed_count();
            let computed = (completed * 100 / total).min(99) as u8;
            if computed > self.execution.progress {
                self.execution.progress = computed;
                self.updated_at = now;
            }
        }
        self.execution.progress
    }

    /// Time spent in `active`, summed over the status history. Paused
    /// stretches do not count.
    pub fn active_time(&self, now: DateTime<Utc>) -> Duration {
        let end = self.execution.ended_at.unwrap_or(now);
        self.history
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.status == GoalStatus::Active)
            .map(|(i, entry)| {
                let left = self.history.get(i + 1).map_or(end, |next| next.entered_at);
                crate::core::clock::elapsed_between(entry.entered_at, left)
            })
            .sum()
    }

    /// Sum of the step estimates.
    pub fn estimated_duration(&self) -> Duration {
        self.strategy.steps.estimated_duration()
    }

    /// Whether active time exceeds `factor` times the estimate.
    pub fn is_overrun(&self, factor: f64, now: DateTime<Utc>) -> bool {
        let estimate = self.estimated_duration();
        !estimate.is_zero()
            && self.active_time(now).as_secs_f64() > factor * estimate.as_secs_f64()
    }

    pub fn summary(&self) -> GoalSummary {
        GoalSummary {
            id: self.id,
            owner: self.owner.clone(),
            title: self.title.clone(),
            goal_type: self.goal_type,
            priority: self.priority,
            status: self.status,
            progress: self.execution.progress,
            approach: self.strategy.approach,
            step_count: self.strategy.steps.len(),
            created_at: self.created_at,
        }
    }
}

/// Caller input for creating a goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalRequest {
    pub owner: String,
    pub title: String,
    pub description: String,
    pub goal_type: GoalType,
    pub priority: GoalPriority,
    pub target_outcome: String,
    pub success_criteria: Vec<String>,
    pub constraints: GoalConstraints,
    /// Pin the execution approach instead of letting the executor choose.
    pub approach: Option<ExecutionApproach>,
}

impl GoalRequest {
    pub fn new(owner: &str, title: &str) -> Self {
        Self {
            owner: owner.to_string(),
            title: title.to_string(),
            description: title.to_string(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_type(mut self, goal_type: GoalType) -> Self {
        self.goal_type = goal_type;
        self
    }

    pub fn with_priority(mut self, priority: GoalPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_approach(mut self, approach: ExecutionApproach) -> Self {
        self.approach = Some(approach);
        self
    }

    pub fn with_prerequisite(mut self, goal: GoalId) -> Self {
        self.constraints.prerequisites.push(goal);
        self
    }
}

/// The persisted view of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSummary {
    pub id: GoalId,
    pub owner: String,
    pub title: String,
    pub goal_type: GoalType,
    pub priority: GoalPriority,
    pub status: GoalStatus,
    pub progress: u8,
    pub approach: ExecutionApproach,
    pub step_count: usize,
    pub created_at: DateTime<Utc>,
}
