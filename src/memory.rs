//! Memory/persistence collaborator.
//!
//! The orchestrator never assumes a storage medium: it records goal
//! summaries and step outcomes through `MemoryStore`. `InMemoryStore` is the
//! process-local implementation used by the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::StepId;
use crate::error::{Error, Result};
use crate::goal::{ExecutionApproach, GoalId, GoalStatus, GoalSummary};
use crate::orchestration::ServiceId;

/// Fields of a stored goal that may change after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalPatch {
    pub status: Option<GoalStatus>,
    pub progress: Option<u8>,
    pub approach: Option<ExecutionApproach>,
}

impl GoalPatch {
    pub fn progress(status: GoalStatus, progress: u8) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            approach: None,
        }
    }
}

/// Outcome of one step attempt on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub goal_id: GoalId,
    pub step_id: StepId,
    pub worker_id: Option<ServiceId>,
    pub success: bool,
    pub result: Option<Value>,
    pub time_to_complete: Option<Duration>,
    pub failure_reasons: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist a new goal; returns the record id.
    async fn store_goal(&self, owner: &str, summary: GoalSummary) -> Result<String>;

    async fn get_goals(&self, owner: &str, status: Option<GoalStatus>)
        -> Result<Vec<GoalSummary>>;

    async fn update_goal(&self, owner: &str, goal_id: GoalId, patch: GoalPatch) -> Result<()>;

    async fn record_task_outcome(&self, outcome: TaskOutcome) -> Result<()>;
}

/// Process-local `MemoryStore`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    goals: RwLock<HashMap<String, BTreeMap<GoalId, GoalSummary>>>,
    outcomes: RwLock<Vec<TaskOutcome>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded task outcome, oldest first.
    pub async fn task_outcomes(&self) -> Vec<TaskOutcome> {
        self.outcomes.read().await.clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store_goal(&self, owner: &str, summary: GoalSummary) -> Result<String> {
        let record_id = summary.id.to_string();
        self.goals
            .write()
            .await
            .entry(owner.to_string())
            .or_default()
            .insert(summary.id, summary);
        Ok(record_id)
    }

    async fn get_goals(
        &self,
        owner: &str,
        status: Option<GoalStatus>,
    ) -> Result<Vec<GoalSummary>> {
        let goals = self.goals.read().await;
        let mut found: Vec<GoalSummary> = goals
            .get(owner)
            .map(|owned| {
                owned
                    .values()
                    .filter(|g| status.map_or(true, |s| g.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by_key(|g| g.created_at);
        Ok(found)
    }

    async fn update_goal(&self, owner: &str, goal_id: GoalId, patch: GoalPatch) -> Result<()> {
        let mut goals = self.goals.write().await;
        let summary = goals
            .get_mut(owner)
            .and_then(|owned| owned.get_mut(&goal_id))
            .ok_or(Error::GoalNotFound(goal_id))?;
        if let Some(status) = patch.status {
            summary.status = status;
        }
        if let Some(progress) = patch.progress {
            summary.progress = progress;
        }
        if let Some(approach) = patch.approach {
            summary.approach = approach;
        }
        Ok(())
    }

    async fn record_task_outcome(&self, outcome: TaskOutcome) -> Result<()> {
        self.outcomes.write().await.push(outcome);
        Ok(())
    }
}
