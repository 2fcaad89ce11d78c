//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Worker services with scripted outcomes
//! - A running orchestrator
//! - Draining event channels

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use autopilot::config::Config;
use autopilot::core::{PlanningStep, StepType};
use autopilot::events::{GoalEvent, OrchestratorEvent};
use autopilot::goal::GoalId;
use autopilot::orchestration::Service;
use autopilot::{ActorHandle, Error, Orchestrator};

/// Operation every fixture worker exposes.
pub const RUN: &str = "run";

/// A worker whose `run` operation echoes its parameters.
pub fn echo_worker(id: &str) -> Service {
    Service::new(id, id).operation(RUN, |params| async move { Ok(params) })
}

/// A worker whose `run` operation always fails.
pub fn failing_worker(id: &str) -> Service {
    Service::new(id, id).operation(RUN, |_| async { Err(Error::Worker("broken".into())) })
}

/// A worker whose `run` operation fails the first `failures` calls.
pub fn flaky_worker(id: &str, failures: usize) -> Service {
    let calls = Arc::new(AtomicUsize::new(0));
    Service::new(id, id).operation(RUN, move |_| {
        let calls = Arc::clone(&calls);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                Err(Error::Worker("transient".into()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    })
}

/// A worker whose `run` operation reports a fixed result quality.
pub fn quality_worker(id: &str, quality: f64) -> Service {
    Service::new(id, id).operation(RUN, move |_| async move { Ok(json!({ "quality": quality })) })
}

/// A worker that appends the `label` parameter of every call to `log`.
pub fn recording_worker(id: &str, log: Arc<Mutex<Vec<String>>>) -> Service {
    Service::new(id, id).operation(RUN, move |params: Value| {
        let log = Arc::clone(&log);
        async move {
            let label = params["label"].as_str().unwrap_or_default().to_string();
            log.lock().unwrap().push(label);
            Ok(Value::Null)
        }
    })
}

/// Build an orchestrator and start its background loops.
pub fn running(config: Config, services: Vec<Service>) -> (Arc<Orchestrator>, ActorHandle) {
    let mut builder = Orchestrator::builder().config(config);
    for service in services {
        builder = builder.service(service);
    }
    let orchestrator = Arc::new(builder.build().expect("orchestrator should build"));
    let handle = orchestrator.spawn();
    (orchestrator, handle)
}

/// A chain of steps, each depending on the previous one, all on `worker`.
pub fn chain(names: &[&str], worker: &str) -> Vec<PlanningStep> {
    let mut steps: Vec<PlanningStep> = Vec::new();
    for name in names {
        let mut step = PlanningStep::new(*name, name, StepType::Action)
            .with_worker(worker)
            .with_operation(RUN);
        if let Some(previous) = steps.last() {
            step = step.depends_on(previous.id.clone());
        }
        steps.push(step);
    }
    steps
}

pub fn drain_goal_events(rx: &mut broadcast::Receiver<GoalEvent>) -> Vec<GoalEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn drain_orchestrator_events(
    rx: &mut broadcast::Receiver<OrchestratorEvent>,
) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Progress values of every `goal.updated` event for `id`, in order.
pub fn progress_of(events: &[GoalEvent], id: GoalId) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            GoalEvent::Updated {
                goal_id, progress, ..
            } if *goal_id == id => Some(*progress),
            _ => None,
        })
        .collect()
}
