//! Typed publish/subscribe channels.
//!
//! Each event category has its own `tokio::sync::broadcast` channel so
//! subscribers only see the payloads they asked for. Publishing with no
//! subscribers is fine; lagging subscribers lose the oldest events.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::goal::{GoalId, GoalStatus};
use crate::orchestration::{
    OperationId, OperationName, OperationStatus, ServiceHealthStatus, ServiceId,
};

/// Default per-channel buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Goal lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GoalEvent {
    Created { goal_id: GoalId, title: String },
    Updated { goal_id: GoalId, progress: u8, status: GoalStatus },
    Completed { goal_id: GoalId },
    Failed { goal_id: GoalId, reason: String },
    Deleted { goal_id: GoalId },
    ReviewRequested { goal_id: GoalId, reason: String },
}

impl GoalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GoalEvent::Created { .. } => "goal.created",
            GoalEvent::Updated { .. } => "goal.updated",
            GoalEvent::Completed { .. } => "goal.completed",
            GoalEvent::Failed { .. } => "goal.failed",
            GoalEvent::Deleted { .. } => "goal.deleted",
            GoalEvent::ReviewRequested { .. } => "goal.review_requested",
        }
    }

    pub fn goal_id(&self) -> GoalId {
        match self {
            GoalEvent::Created { goal_id, .. }
            | GoalEvent::Updated { goal_id, .. }
            | GoalEvent::Completed { goal_id }
            | GoalEvent::Failed { goal_id, .. }
            | GoalEvent::Deleted { goal_id }
            | GoalEvent::ReviewRequested { goal_id, .. } => *goal_id,
        }
    }
}

/// System-wide health notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Emergency {
        health_fraction: f64,
    },
    Recovered {
        health_fraction: f64,
    },
    ServiceStatusChanged {
        service: ServiceId,
        from: ServiceHealthStatus,
        to: ServiceHealthStatus,
    },
}

impl OrchestratorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::Emergency { .. } => "orchestrator.emergency",
            OrchestratorEvent::Recovered { .. } => "orchestrator.recovered",
            OrchestratorEvent::ServiceStatusChanged { .. } => "service.status_changed",
        }
    }
}

/// An operation changed status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEvent {
    pub operation_id: OperationId,
    pub service: ServiceId,
    pub operation: OperationName,
    pub status: OperationStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl OperationEvent {
    pub fn name(&self) -> &'static str {
        "operation.updated"
    }
}

/// Broadcast channels for every event category.
///
/// Clones share the same channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    goals: broadcast::Sender<GoalEvent>,
    orchestrator: broadcast::Sender<OrchestratorEvent>,
    operations: broadcast::Sender<OperationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (goals, _) = broadcast::channel(capacity);
        let (orchestrator, _) = broadcast::channel(capacity);
        let (operations, _) = broadcast::channel(capacity);
        Self {
            goals,
            orchestrator,
            operations,
        }
    }

    pub fn publish_goal(&self, event: GoalEvent) {
        crate::aplog_trace!("event: {} {}", event.name(), event.goal_id().short());
        let _ = self.goals.send(event);
    }

    pub fn publish_orchestrator(&self, event: OrchestratorEvent) {
        crate::aplog_trace!("event: {}", event.name());
        let _ = self.orchestrator.send(event);
    }

    pub fn publish_operation(&self, event: OperationEvent) {
        crate::aplog_trace!(
            "event: {} {} {}",
            event.name(),
            event.operation_id.short(),
            event.status
        );
        let _ = self.operations.send(event);
    }

    pub fn subscribe_goals(&self) -> broadcast::Receiver<GoalEvent> {
        self.goals.subscribe()
    }

    pub fn subscribe_orchestrator(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.orchestrator.subscribe()
    }

    pub fn subscribe_operations(&self) -> broadcast::Receiver<OperationEvent> {
        self.operations.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
