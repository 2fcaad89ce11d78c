//! Operation queue integration tests.
//!
//! These tests verify priority ordering, cancellation, availability gating
//! and shutdown of the operation queue inside an assembled orchestrator.

use std::sync::{Arc, Mutex};

use serde_json::json;

use autopilot::config::Config;
use autopilot::orchestration::{OperationName, OperationStatus, Priority, ServiceId};
use autopilot::{Error, Orchestrator};

use super::fixtures::{echo_worker, recording_worker, running, RUN};

/// Test: Priority order with one slot
/// Given operations queued at [low, high, medium] with capacity 1
/// When the dispatch loop drains the queue
/// Then they run in the order [high, medium, low]
#[tokio::test]
async fn test_dispatch_order_follows_priority() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let config = Config {
        max_concurrent_operations: 1,
        ..Config::default()
    };
    let orchestrator = Orchestrator::builder()
        .config(config)
        .service(recording_worker("worker", Arc::clone(&log)))
        .build()
        .unwrap();
    let queue = orchestrator.queue();
    let worker = ServiceId::from("worker");
    let run = OperationName::from(RUN);

    let mut tickets = Vec::new();
    for (label, priority) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("medium", Priority::Medium),
    ] {
        tickets.push(
            queue
                .enqueue(&worker, &run, json!({ "label": label }), priority)
                .await
                .unwrap(),
        );
    }
    assert_eq!(queue.queued_len().await, 3);

    // Start the loops only after everything is queued.
    let orchestrator = Arc::new(orchestrator);
    let handle = orchestrator.spawn();
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }

    assert_eq!(*log.lock().unwrap(), vec!["high", "medium", "low"]);
    handle.shutdown();
}

/// Test: Cancelling a finished operation is a no-op
#[tokio::test]
async fn test_cancel_terminal_operation_twice() {
    let (orchestrator, handle) = running(Config::default(), vec![echo_worker("echo")]);
    let queue = orchestrator.queue();

    let ticket = queue
        .enqueue(&"echo".into(), &RUN.into(), json!(1), Priority::Medium)
        .await
        .unwrap();
    let id = ticket.id();
    assert_eq!(tokio_test::assert_ok!(ticket.wait().await), json!(1));

    assert!(!queue.cancel(id).await);
    assert!(!queue.cancel(id).await);
    let op = queue.status(id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    handle.shutdown();
}

/// Test: Unknown operation names are rejected at enqueue time
#[tokio::test]
async fn test_unknown_operation_not_supported() {
    let orchestrator = Orchestrator::builder()
        .service(echo_worker("echo"))
        .build()
        .unwrap();

    let result = orchestrator
        .queue()
        .enqueue(&"echo".into(), &"explode".into(), json!(null), Priority::Low)
        .await;
    assert!(matches!(result, Err(Error::OperationNotSupported { .. })));
}

/// Test: Operations wait for an unavailable service and are cancelled on shutdown
/// Given an offline target service
/// When an operation is queued and the queue dispatches
/// Then it stays queued, and shutdown resolves it as cancelled
#[tokio::test]
async fn test_unavailable_service_holds_operation_until_shutdown() {
    let orchestrator = Orchestrator::builder()
        .service(echo_worker("echo"))
        .build()
        .unwrap();
    let echo = ServiceId::from("echo");
    orchestrator.registry().write().await.mark_offline(&echo).unwrap();

    let queue = orchestrator.queue();
    let ticket = queue
        .enqueue(&echo, &RUN.into(), json!(null), Priority::High)
        .await
        .unwrap();
    assert_eq!(queue.dispatch_tick().await, 0);
    assert_eq!(queue.queued_len().await, 1);

    assert_eq!(orchestrator.shutdown().await, 1);
    assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
    assert!(matches!(
        queue.enqueue(&echo, &RUN.into(), json!(null), Priority::High).await,
        Err(Error::Cancelled)
    ));
}
