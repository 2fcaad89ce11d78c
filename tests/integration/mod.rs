//! Integration test suite for autopilot.
//!
//! These tests drive a fully assembled `Orchestrator` with in-process
//! worker services and observe it through its event channels.
//!
//! # Test Categories
//!
//! - `health_registry`: health classification, emergency edge trigger, recovery
//! - `queue_dispatch`: priority order, cancellation, shutdown
//! - `goal_lifecycle`: end-to-end goal execution and planning rejection
//! - `contingency_flows`: alternative workers, adapt and abort

mod fixtures;

mod contingency_flows;
mod goal_lifecycle;
mod health_registry;
mod queue_dispatch;
