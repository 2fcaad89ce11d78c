use std::time::Duration;

use thiserror::Error;

use crate::core::StepId;
use crate::goal::GoalId;
use crate::orchestration::{OperationName, ServiceId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Service not found: {0}")]
    ServiceNotFound(ServiceId),

    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: ServiceId },

    #[error("Operation '{operation}' is not supported by service {service}")]
    OperationNotSupported {
        service: ServiceId,
        operation: OperationName,
    },

    #[error("Operation '{operation}' on {service} timed out after {timeout:?}")]
    OperationTimeout {
        service: ServiceId,
        operation: OperationName,
        timeout: Duration,
    },

    #[error("Operation queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Step {step} waited {waited:?} for unmet dependencies: {}", format_ids(.unmet))]
    DependencyTimeout {
        step: StepId,
        unmet: Vec<StepId>,
        waited: Duration,
    },

    #[error("Step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    #[error("Step '{step}' aborted: {reason}")]
    StepAborted { step: String, reason: String },

    #[error("Step '{step}' escalated for review: {reason}")]
    StepEscalated { step: String, reason: String },

    #[error("Goal planning failed: {0}")]
    GoalPlanningFailure(String),

    #[error("Goal not found: {0}")]
    GoalNotFound(GoalId),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("System health {fraction:.2} is below the emergency threshold")]
    EmergencyHealthBreach { fraction: f64 },

    #[error("Essential service {service} failed to initialize: {reason}")]
    EssentialServiceFailed { service: ServiceId, reason: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Stable name of the error kind, used in goal failure reason chains.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "Io",
            Error::Json(_) => "Json",
            Error::TomlParse(_) | Error::TomlSerialize(_) => "Toml",
            Error::NoHomeDir => "NoHomeDir",
            Error::Config(_) => "Config",
            Error::Validation(_) => "Validation",
            Error::Timeout(_) => "Timeout",
            Error::ServiceNotFound(_) => "ServiceNotFound",
            Error::ServiceUnavailable { .. } => "ServiceUnavailable",
            Error::OperationNotSupported { .. } => "OperationNotSupported",
            Error::OperationTimeout { .. } => "OperationTimeout",
            Error::QueueFull { .. } => "QueueFull",
            Error::Cancelled => "Cancelled",
            Error::Worker(_) => "Worker",
            Error::DependencyTimeout { .. } => "DependencyTimeout",
            Error::StepFailure { .. } => "StepFailure",
            Error::StepAborted { .. } => "StepAborted",
            Error::StepEscalated { .. } => "StepEscalated",
            Error::GoalPlanningFailure(_) => "GoalPlanningFailure",
            Error::GoalNotFound(_) => "GoalNotFound",
            Error::InvalidStatusTransition { .. } => "InvalidStatusTransition",
            Error::EmergencyHealthBreach { .. } => "EmergencyHealthBreach",
            Error::EssentialServiceFailed { .. } => "EssentialServiceFailed",
            Error::TaskJoin(_) => "TaskJoin",
        }
    }
}

fn format_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
