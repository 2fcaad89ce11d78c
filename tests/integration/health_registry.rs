//! Service health integration tests.
//!
//! These tests verify health classification, the edge-triggered emergency
//! signal, and auto-recovery of essential services through the
//! orchestrator's health tick.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use autopilot::config::Config;
use autopilot::core::TimerKind;
use autopilot::events::OrchestratorEvent;
use autopilot::orchestration::{Service, ServiceHealthStatus, ServiceId};
use autopilot::{Error, Orchestrator};

use super::fixtures::{drain_orchestrator_events, echo_worker};

/// Test: Repeated failures turn an essential service critical
/// Given essential service S1
/// When it reports 6 consecutive failures and a health check runs
/// Then its status is critical and a status change is published
#[tokio::test]
async fn test_consecutive_failures_turn_service_critical() {
    let orchestrator = Orchestrator::builder()
        .service(echo_worker("s1").essential(true))
        .build()
        .unwrap();
    let mut rx = orchestrator.events().subscribe_orchestrator();
    let s1 = ServiceId::from("s1");

    {
        let mut registry = orchestrator.registry().write().await;
        for _ in 0..6 {
            registry.report_outcome(&s1, false, 50.0).unwrap();
        }
    }
    orchestrator.run_timer(TimerKind::HealthCheck).await.unwrap();

    let registry = orchestrator.registry().read().await;
    assert_eq!(registry.status(&s1), Some(ServiceHealthStatus::Critical));
    assert!(!registry.is_available(&s1));

    let events = drain_orchestrator_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::ServiceStatusChanged {
            to: ServiceHealthStatus::Critical,
            ..
        }
    )));
}

/// Test: One failure on a clean record sets the error rate to the smoothing factor
#[tokio::test]
async fn test_single_failure_error_rate_equals_alpha() {
    let orchestrator = Orchestrator::builder()
        .service(echo_worker("s1"))
        .build()
        .unwrap();
    let s1 = ServiceId::from("s1");

    let mut registry = orchestrator.registry().write().await;
    registry.report_outcome(&s1, false, 10.0).unwrap();
    assert_eq!(registry.get(&s1).unwrap().error_rate, 0.1);
}

/// Test: Emergency fires exactly once per breach
/// Given 20 services at 0.9 health
/// When health drops to 0.05 and stays there across two checks
/// Then exactly one orchestrator.emergency event is emitted
#[tokio::test]
async fn test_emergency_is_edge_triggered() {
    let mut builder = Orchestrator::builder();
    let ids: Vec<ServiceId> = (0..20).map(|i| ServiceId::from(format!("s{i}"))).collect();
    for id in &ids {
        builder = builder.service(echo_worker(id.as_str()));
    }
    let orchestrator = builder.build().unwrap();
    let mut rx = orchestrator.events().subscribe_orchestrator();

    {
        let mut registry = orchestrator.registry().write().await;
        for id in &ids[..2] {
            registry.mark_offline(id).unwrap();
        }
    }
    orchestrator.run_timer(TimerKind::HealthCheck).await.unwrap();
    assert_eq!(orchestrator.system_health().await.health_percentage, 90.0);

    {
        let mut registry = orchestrator.registry().write().await;
        for id in &ids[2..19] {
            registry.mark_offline(id).unwrap();
        }
    }
    orchestrator.run_timer(TimerKind::HealthCheck).await.unwrap();
    orchestrator.run_timer(TimerKind::HealthCheck).await.unwrap();

    let health = orchestrator.system_health().await;
    assert!((health.health_percentage - 5.0).abs() < 1e-9);
    assert!(health.in_emergency);

    let emergencies: Vec<_> = drain_orchestrator_events(&mut rx)
        .into_iter()
        .filter(|e| e.name() == "orchestrator.emergency")
        .collect();
    assert_eq!(emergencies.len(), 1);
    match &emergencies[0] {
        OrchestratorEvent::Emergency { health_fraction } => {
            assert!((health_fraction - 0.05).abs() < 1e-9)
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Test: Essential service recovered by re-initialization
/// Given an essential service whose first initialization fails
/// When the orchestrator starts with auto-recovery and a health check runs
/// Then the service is re-initialized and back to healthy
#[tokio::test]
async fn test_essential_service_auto_recovery() {
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);
    let db = Service::new("db", "Database")
        .essential(true)
        .on_initialize(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Worker("connection refused".into()))
                } else {
                    Ok(())
                }
            }
        });
    let orchestrator = Orchestrator::builder().service(db).build().unwrap();
    let db = ServiceId::from("db");

    tokio_test::assert_ok!(orchestrator.startup().await);
    assert_eq!(
        orchestrator.registry().read().await.status(&db),
        Some(ServiceHealthStatus::Offline)
    );

    orchestrator.run_timer(TimerKind::HealthCheck).await.unwrap();

    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(
        orchestrator.registry().read().await.status(&db),
        Some(ServiceHealthStatus::Healthy)
    );
}

/// Test: Essential failure is fatal when auto-recovery is off
#[tokio::test]
async fn test_essential_failure_without_recovery_is_fatal() {
    let config = Config {
        auto_recovery: false,
        ..Config::default()
    };
    let db = Service::new("db", "Database")
        .essential(true)
        .on_initialize(|| async { Err(Error::Worker("connection refused".into())) });
    let orchestrator = Orchestrator::builder()
        .config(config)
        .service(db)
        .build()
        .unwrap();

    let err = tokio_test::assert_err!(orchestrator.startup().await);
    assert!(matches!(err, Error::EssentialServiceFailed { .. }));
}
