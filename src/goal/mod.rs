//! Goals: model, lifecycle, planning and execution.
//!
//! A goal is a user-level objective decomposed into a graph of planning
//! steps. `GoalPlanner` builds the plan, `GoalExecutor` owns goals and
//! drives them through `planning -> active -> completed | failed`.

pub mod executor;
pub mod insights;
pub mod planner;
pub mod state;
pub mod types;

pub use executor::{select_approach, GoalExecutor, ReviewReport, SYSTEM_OWNER};
pub use insights::{GoalInsights, PerformanceTracker, WorkerPerformance};
pub use planner::{GoalPlanner, DEFAULT_MIN_QUALITY};
pub use state::{GoalStatus, StatusHistoryEntry};
pub use types::{
    ExecutionApproach, ExecutionSnapshot, Goal, GoalConstraints, GoalId, GoalPriority,
    GoalRequest, GoalStrategy, GoalSummary, GoalType,
};
