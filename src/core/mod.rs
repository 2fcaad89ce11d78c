//! Core domain models for goal orchestration.
//!
//! This module contains the planning step model, the step dependency
//! graph, and the clock and timer abstractions that drive the periodic
//! background work.

pub mod clock;
pub mod dag;
pub mod step;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dag::StepGraph;
pub use step::{PlanningStep, RiskLevel, StepId, StepStatus, StepType};
pub use timer::{TimerKind, TimerSchedule};
