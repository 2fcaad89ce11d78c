//! Planning step data model.
//!
//! Steps are the atomic units of a goal's plan. Each step names the
//! worker service and operation that carries it out, the steps it
//! depends on, and tracks its own execution status and result.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestration::{OperationName, ServiceId};

/// Identifier of a step, unique within its goal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Research,
    Action,
    Analysis,
    Verification,
    Coordination,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Research => "research",
            StepType::Action => "action",
            StepType::Analysis => "analysis",
            StepType::Verification => "verification",
            StepType::Coordination => "coordination",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "research" => Ok(StepType::Research),
            "action" => Ok(StepType::Action),
            "analysis" => Ok(StepType::Analysis),
            "verification" => Ok(StepType::Verification),
            "coordination" => Ok(StepType::Coordination),
            other => Err(crate::Error::Validation(format!(
                "unknown step type: {}",
                other
            ))),
        }
    }
}

/// Risk classification of a step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Step status in its lifecycle.
///
/// pending -> ready -> executing -> completed | failed | blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Blocked,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Ready => write!(f, "ready"),
            StepStatus::Executing => write!(f, "executing"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// A single step in a goal's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningStep {
    pub id: StepId,
    pub name: String,
    pub description: String,
    pub step_type: StepType,
    /// Steps that must complete before this one may execute.
    pub dependencies: Vec<StepId>,
    pub estimated_duration: Duration,
    pub capabilities: Vec<String>,
    /// Workers allowed to run this step; the first entry is the assigned one.
    pub workers: Vec<ServiceId>,
    /// Operation invoked on the assigned worker.
    pub operation: OperationName,
    pub risk: RiskLevel,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of contingency plans applied to this step.
    pub attempts: u32,
    /// Applications per contingency plan, keyed by the plan's index in the goal.
    #[serde(default)]
    pub plan_attempts: BTreeMap<usize, u32>,
    /// Workers already tried by the `alternative` contingency.
    pub tried_workers: Vec<ServiceId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlanningStep {
    /// Create a pending step whose operation is named after its type.
    pub fn new(id: impl Into<StepId>, name: &str, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: String::new(),
            step_type,
            dependencies: Vec::new(),
            estimated_duration: Duration::from_secs(60),
            capabilities: Vec::new(),
            workers: Vec::new(),
            operation: OperationName::from(step_type.as_str()),
            risk: RiskLevel::Low,
            status: StepStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            plan_attempts: BTreeMap::new(),
            tried_workers: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, id: impl Into<StepId>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn with_worker(mut self, worker: impl Into<ServiceId>) -> Self {
        self.workers.push(worker.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<OperationName>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capabilities.push(capability.to_string());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// The worker the step is currently assigned to.
    pub fn assigned_worker(&self) -> Option<&ServiceId> {
        self.workers.first()
    }

    /// Swap the assigned worker, keeping the previous one in the tried list.
    pub fn reassign(&mut self, worker: ServiceId) {
        if let Some(current) = self.workers.first().cloned() {
            if !self.tried_workers.contains(&current) {
                self.tried_workers.push(current);
            }
        }
        self.workers.retain(|w| w != &worker);
        self.workers.insert(0, worker);
    }

    pub fn mark_ready(&mut self) {
        self.status = StepStatus::Ready;
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Executing;
        self.started_at = Some(now);
        self.error = None;
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
    }

    pub fn block(&mut self, reason: &str) {
        self.status = StepStatus::Blocked;
        self.error = Some(reason.to_string());
    }

    /// Return a failed or blocked step to the pending state.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
    }

    /// How often the plan at `index` has been applied to this step.
    pub fn attempts_for(&self, index: usize) -> u32 {
        self.plan_attempts.get(&index).copied().unwrap_or(0)
    }

    /// Count one application of the plan at `index`.
    pub fn record_plan_attempt(&mut self, index: usize) {
        *self.plan_attempts.entry(index).or_insert(0) += 1;
        self.attempts += 1;
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    /// Time between start and completion, if both are known.
    pub fn time_to_complete(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(crate::core::clock::elapsed_between(start, end)),
            _ => None,
        }
    }
}
