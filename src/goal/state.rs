//! Goal lifecycle with transition validation.
//!
//! planning -> active -> { paused <-> active } -> { completed | failed }

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::goal::types::Goal;

/// Status of a goal in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Created; the plan may still change.
    #[default]
    Planning,
    Active,
    Paused,
    Completed,
    Failed,
}

impl GoalStatus {
    /// Check if a transition to the target status is valid.
    ///
    /// Valid transitions:
    /// - Planning -> Active
    /// - Active -> Paused, Completed, Failed
    /// - Paused -> Active
    pub fn can_transition_to(&self, target: GoalStatus) -> bool {
        matches!(
            (self, target),
            (GoalStatus::Planning, GoalStatus::Active)
                | (GoalStatus::Active, GoalStatus::Paused)
                | (GoalStatus::Active, GoalStatus::Completed)
                | (GoalStatus::Active, GoalStatus::Failed)
                | (GoalStatus::Paused, GoalStatus::Active)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GoalStatus::Completed | GoalStatus::Failed)
    }

    /// Counted against the target number of open goals.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GoalStatus::Planning => write!(f, "planning"),
            GoalStatus::Active => write!(f, "active"),
            GoalStatus::Paused => write!(f, "paused"),
            GoalStatus::Completed => write!(f, "completed"),
            GoalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: GoalStatus,
    pub entered_at: DateTime<Utc>,
}

impl Goal {
    /// Move the goal to `target`, stamping the execution snapshot.
    ///
    /// Entering `active` for the first time sets the start timestamp;
    /// entering `completed` forces progress to 100; both terminal states set
    /// the end timestamp.
    pub fn transition(&mut self, target: GoalStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        match target {
            GoalStatus::Active if self.execution.started_at.is_none() => {
                self.execution.started_at = Some(now);
            }
            GoalStatus::Completed => {
                self.execution.progress = 100;
                self.execution.ended_at = Some(now);
            }
            GoalStatus::Failed => {
                self.execution.ended_at = Some(now);
            }
            _ => {}
        }

        crate::aplog_debug!("goal {}: {} -> {}", self.id.short(), self.status, target);
        self.status = target;
        self.updated_at = now;
        self.history.push(StatusHistoryEntry {
            status: target,
            entered_at: now,
        });
        Ok(())
    }

    /// Mark the goal failed with a reason.
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(GoalStatus::Failed, now)?;
        self.failure_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn status_history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }
}
