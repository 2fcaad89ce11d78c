//! Contingency plans and their evaluation.
//!
//! A goal carries an ordered list of `ContingencyPlan`s. When a step fails,
//! the scheduler builds a `FailureContext` from the error and asks the
//! `ContingencyManager` for a decision. The first plan whose trigger and
//! condition match, and whose attempt cap has not been reached, is applied
//! to the goal in place.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{PlanningStep, StepId, StepType};
use crate::error::{Error, Result};
use crate::goal::{ExecutionApproach, Goal};
use crate::orchestration::ServiceId;
use crate::{aplog_debug, aplog_warn};

/// Default per-step cap on how often one plan may be applied.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContingencyTrigger {
    /// The worker call returned an error.
    StepFailure,
    /// The worker is missing, unavailable, or the queue rejected the call.
    ResourceUnavailable,
    /// A call or dependency wait timed out.
    TimeConstraint,
    /// The worker's result scored below the required quality.
    QualityThreshold,
}

impl std::fmt::Display for ContingencyTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContingencyTrigger::StepFailure => write!(f, "step_failure"),
            ContingencyTrigger::ResourceUnavailable => write!(f, "resource_unavailable"),
            ContingencyTrigger::TimeConstraint => write!(f, "time_constraint"),
            ContingencyTrigger::QualityThreshold => write!(f, "quality_threshold"),
        }
    }
}

/// A failure-message pattern, compiled once and serialized as its source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ErrorPattern(Regex);

impl ErrorPattern {
    /// # Errors
    /// Returns `GoalPlanningFailure` if `pattern` is not a valid regex.
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern).map(Self).map_err(|e| {
            Error::GoalPlanningFailure(format!(
                "invalid contingency pattern '{}': {}",
                pattern, e
            ))
        })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, message: &str) -> bool {
        self.0.is_match(message)
    }
}

impl PartialEq for ErrorPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl TryFrom<String> for ErrorPattern {
    type Error = Error;

    fn try_from(pattern: String) -> Result<Self> {
        Self::new(&pattern)
    }
}

impl From<ErrorPattern> for String {
    fn from(pattern: ErrorPattern) -> Self {
        pattern.as_str().to_string()
    }
}

/// Declarative condition narrowing when a plan applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContingencyCondition {
    #[default]
    Always,
    /// The failure message matches a regular expression.
    ErrorMatches { pattern: ErrorPattern },
    /// The failed step has the given type.
    StepType { step_type: StepType },
}

impl ContingencyCondition {
    /// Condition on the failure message.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` if `pattern` is not a valid regex.
    pub fn error_matches(pattern: &str) -> Result<Self> {
        Ok(ContingencyCondition::ErrorMatches {
            pattern: ErrorPattern::new(pattern)?,
        })
    }

    fn matches(&self, step: &PlanningStep, failure: &FailureContext) -> bool {
        match self {
            ContingencyCondition::Always => true,
            ContingencyCondition::ErrorMatches { pattern } => pattern.is_match(&failure.message),
            ContingencyCondition::StepType { step_type } => step.step_type == *step_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContingencyAction {
    Retry,
    Alternative,
    Adapt,
    Escalate,
    Abort,
}

impl std::fmt::Display for ContingencyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContingencyAction::Retry => write!(f, "retry"),
            ContingencyAction::Alternative => write!(f, "alternative"),
            ContingencyAction::Adapt => write!(f, "adapt"),
            ContingencyAction::Escalate => write!(f, "escalate"),
            ContingencyAction::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContingencyParameters {
    /// Delay before a retried step is resubmitted.
    pub delay_ms: u64,
    /// Workers the `alternative` action may switch to. When empty, the
    /// step's own secondary workers are used.
    pub alternatives: Vec<ServiceId>,
    /// Approach forced by `adapt`; parallel when unset.
    pub approach: Option<ExecutionApproach>,
    pub max_attempts: u32,
    /// Minimum `quality` a worker result must report.
    pub min_quality: Option<f64>,
}

impl Default for ContingencyParameters {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            alternatives: Vec::new(),
            approach: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_quality: None,
        }
    }
}

/// A reaction to a named failure trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyPlan {
    pub trigger: ContingencyTrigger,
    #[serde(default)]
    pub condition: ContingencyCondition,
    pub action: ContingencyAction,
    #[serde(default)]
    pub parameters: ContingencyParameters,
    /// Estimated likelihood the trigger fires. Informational only.
    #[serde(default)]
    pub probability: f64,
}

impl ContingencyPlan {
    pub fn new(trigger: ContingencyTrigger, action: ContingencyAction) -> Self {
        Self {
            trigger,
            condition: ContingencyCondition::Always,
            action,
            parameters: ContingencyParameters::default(),
            probability: 0.0,
        }
    }

    pub fn when(mut self, condition: ContingencyCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.parameters.delay_ms = delay_ms;
        self
    }

    pub fn with_alternatives(mut self, alternatives: Vec<ServiceId>) -> Self {
        self.parameters.alternatives = alternatives;
        self
    }

    pub fn with_approach(mut self, approach: ExecutionApproach) -> Self {
        self.parameters.approach = Some(approach);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.parameters.max_attempts = max_attempts;
        self
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.parameters.min_quality = Some(min_quality);
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    /// Check the plan before it is attached to a goal.
    ///
    /// # Errors
    /// Returns `GoalPlanningFailure` for a probability outside [0, 1] or a
    /// quality plan without `min_quality`.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(Error::GoalPlanningFailure(format!(
                "contingency probability {} is outside [0, 1]",
                self.probability
            )));
        }
        if self.trigger == ContingencyTrigger::QualityThreshold
            && self.parameters.min_quality.is_none()
        {
            return Err(Error::GoalPlanningFailure(
                "quality_threshold contingency requires min_quality".to_string(),
            ));
        }
        Ok(())
    }
}

/// What went wrong with a step, as seen by the contingency rules.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureContext {
    pub trigger: ContingencyTrigger,
    /// `Error::kind()` of the underlying error.
    pub kind: &'static str,
    pub message: String,
    /// Whether resubmitting the same call can succeed.
    pub retryable: bool,
}

impl FailureContext {
    /// Classify an error into a trigger.
    pub fn from_error(error: &Error) -> Self {
        let trigger = match error {
            Error::ServiceUnavailable { .. }
            | Error::ServiceNotFound(_)
            | Error::OperationNotSupported { .. }
            | Error::QueueFull { .. } => ContingencyTrigger::ResourceUnavailable,
            Error::OperationTimeout { .. }
            | Error::DependencyTimeout { .. }
            | Error::Timeout(_) => ContingencyTrigger::TimeConstraint,
            _ => ContingencyTrigger::StepFailure,
        };
        let retryable = !matches!(
            error,
            Error::OperationNotSupported { .. } | Error::ServiceNotFound(_)
        );
        Self {
            trigger,
            kind: error.kind(),
            message: error.to_string(),
            retryable,
        }
    }

    /// A result whose quality fell short of the required minimum.
    pub fn quality(observed: f64, required: f64) -> Self {
        Self {
            trigger: ContingencyTrigger::QualityThreshold,
            kind: "StepFailure",
            message: format!("result quality {:.2} below required {:.2}", observed, required),
            retryable: true,
        }
    }
}

/// Outcome of a contingency evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ContingencyDecision {
    /// Step reset to pending; resubmit after the delay.
    Retry { delay: Duration },
    /// Step reassigned and reset to pending; resubmit.
    Alternative { worker: ServiceId },
    /// Goal approach changed and step reset; the driving loop picks it up.
    Adapted { approach: ExecutionApproach },
    /// Goal flagged for review; step stays failed.
    Escalated { reason: String },
    Aborted { reason: String },
    /// No plan matched.
    Unhandled,
}

impl ContingencyDecision {
    /// Whether the failed step was put back into play.
    pub fn resumes_step(&self) -> bool {
        matches!(
            self,
            ContingencyDecision::Retry { .. }
                | ContingencyDecision::Alternative { .. }
                | ContingencyDecision::Adapted { .. }
        )
    }
}

/// Applies a goal's contingency plans to failed steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContingencyManager;

impl ContingencyManager {
    pub fn new() -> Self {
        Self
    }

    /// Pick and apply the first matching plan for a failed step.
    ///
    /// # Arguments
    /// * `goal` - The goal owning the step; mutated in place
    /// * `step_id` - The failed step
    /// * `failure` - Classification of the failure
    ///
    /// # Errors
    /// Returns `Validation` if the step is not part of the goal's plan.
    pub fn evaluate(
        &self,
        goal: &mut Goal,
        step_id: &StepId,
        failure: &FailureContext,
    ) -> Result<ContingencyDecision> {
        let step = goal
            .strategy
            .steps
            .get(step_id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", step_id)))?;

        let selected = goal
            .strategy
            .contingencies
            .iter()
            .enumerate()
            .find_map(|(index, plan)| {
                if plan.trigger != failure.trigger || !plan.condition.matches(step, failure) {
                    return None;
                }
                if step.attempts_for(index) >= plan.parameters.max_attempts {
                    return None;
                }
                match plan.action {
                    ContingencyAction::Retry if !failure.retryable => None,
                    ContingencyAction::Alternative => alternative_worker(step, plan)
                        .map(|worker| (index, plan.clone(), Some(worker))),
                    _ => Some((index, plan.clone(), None)),
                }
            });

        let Some((index, plan, worker)) = selected else {
            aplog_debug!(
                "goal {}: no contingency for step {} ({})",
                goal.id.short(),
                step_id,
                failure.trigger
            );
            return Ok(ContingencyDecision::Unhandled);
        };

        let goal_id = goal.id.short();
        let mut approach = None;
        if plan.action == ContingencyAction::Adapt {
            let forced = plan
                .parameters
                .approach
                .unwrap_or(ExecutionApproach::Parallel);
            goal.strategy.approach = forced;
            approach = Some(forced);
        }
        if plan.action == ContingencyAction::Escalate {
            goal.needs_review = true;
        }

        let step = goal
            .strategy
            .steps
            .get_mut(step_id)
            .ok_or_else(|| Error::Validation(format!("Step {} not found in plan", step_id)))?;
        step.record_plan_attempt(index);
        aplog_debug!(
            "goal {}: step {} {} -> {} (attempt {} of {})",
            goal_id,
            step_id,
            failure.trigger,
            plan.action,
            step.attempts_for(index),
            plan.parameters.max_attempts
        );

        let decision = match (plan.action, worker, approach) {
            (ContingencyAction::Alternative, Some(worker), _) => {
                step.reassign(worker.clone());
                step.reset();
                ContingencyDecision::Alternative { worker }
            }
            (ContingencyAction::Adapt, _, Some(approach)) => {
                step.reset();
                ContingencyDecision::Adapted { approach }
            }
            (ContingencyAction::Escalate, _, _) => {
                aplog_warn!("goal {}: step {} escalated: {}", goal_id, step_id, failure.message);
                ContingencyDecision::Escalated {
                    reason: failure.message.clone(),
                }
            }
            (ContingencyAction::Abort, _, _) => ContingencyDecision::Aborted {
                reason: failure.message.clone(),
            },
            _ => {
                step.reset();
                ContingencyDecision::Retry {
                    delay: Duration::from_millis(plan.parameters.delay_ms),
                }
            }
        };
        Ok(decision)
    }
}

/// First allowed worker the step has not run on yet.
fn alternative_worker(step: &PlanningStep, plan: &ContingencyPlan) -> Option<ServiceId> {
    let candidates: &[ServiceId] = if plan.parameters.alternatives.is_empty() {
        step.workers.get(1..).unwrap_or(&[])
    } else {
        &plan.parameters.alternatives
    };
    let current = step.assigned_worker();
    candidates
        .iter()
        .find(|w| Some(*w) != current && !step.tried_workers.contains(w))
        .cloned()
}
