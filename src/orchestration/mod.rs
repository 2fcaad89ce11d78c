//! Service orchestration.
//!
//! Services register named async operations. The health registry tracks
//! each service's condition, the operation queue runs operations under a
//! concurrency limit, and the step scheduler drives goal plans through the
//! queue, consulting contingency plans when a step fails.

pub mod contingency;
pub mod health;
pub mod queue;
pub mod scheduler;
pub mod service;

pub use contingency::{
    ContingencyAction, ContingencyCondition, ContingencyDecision, ContingencyManager,
    ContingencyParameters, ContingencyPlan, ContingencyTrigger, ErrorPattern, FailureContext,
    DEFAULT_MAX_ATTEMPTS,
};
pub use health::{
    EmergencySignal, HealthMonitor, HealthReport, ServiceHealth, ServiceHealthRegistry,
    ServiceHealthStatus, StatusChange,
};
pub use queue::{
    Operation, OperationId, OperationQueue, OperationStatus, OperationTicket, Priority,
};
pub use scheduler::{
    NoProgress, ProgressSink, ProgressUpdate, RunControl, StepReport, StepScheduler,
};
pub use service::{Handler, OperationName, Service, ServiceDirectory, ServiceId};
