pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod goal;
pub mod log;
pub mod memory;
pub mod orchestration;
pub mod orchestrator;
pub mod util;

pub use error::{Error, Result};
pub use orchestrator::{ActorHandle, Orchestrator, OrchestratorBuilder, SystemHealth};
