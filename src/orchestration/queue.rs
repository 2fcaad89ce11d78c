//! Priority operation queue.
//!
//! The `OperationQueue` holds operations submitted against registered
//! services and dispatches them under a global concurrency cap. Dispatch
//! picks the highest priority first and keeps FIFO order within a
//! priority tier. Operations whose service is not available stay queued.
//! Each dispatched call runs in its own task under the service timeout and
//! reports its outcome to the health registry.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::clock::{elapsed_between, Clock};
use crate::error::{Error, Result};
use crate::events::{EventBus, OperationEvent};
use crate::orchestration::health::ServiceHealthRegistry;
use crate::orchestration::service::{Handler, OperationName, ServiceDirectory, ServiceId};
use crate::{aplog_debug, aplog_warn};

/// Terminal operations kept for `status` lookups after they leave the
/// active map.
pub const HISTORY_LIMIT: usize = 256;

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Dispatch priority. Higher variants drain first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Operation status in its lifecycle.
///
/// queued -> executing -> completed | failed | cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Queued => write!(f, "queued"),
            OperationStatus::Executing => write!(f, "executing"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One request against a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub service: ServiceId,
    pub name: OperationName,
    pub params: Value,
    pub status: OperationStatus,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Submission sequence, the FIFO tie-breaker within a priority.
    #[serde(skip)]
    seq: u64,
}

impl From<&Operation> for OperationEvent {
    fn from(op: &Operation) -> Self {
        OperationEvent {
            operation_id: op.id,
            service: op.service.clone(),
            operation: op.name.clone(),
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
        }
    }
}

/// Handle returned by `enqueue`, resolved when the operation is terminal.
#[derive(Debug)]
pub struct OperationTicket {
    id: OperationId,
    rx: oneshot::Receiver<Result<Value>>,
}

impl OperationTicket {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the operation's outcome.
    ///
    /// A cancelled operation, or one dropped by a queue shutdown, resolves
    /// to `Error::Cancelled`.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[derive(Default)]
struct QueueState {
    operations: HashMap<OperationId, Operation>,
    pending: BTreeMap<(Reverse<Priority>, u64), OperationId>,
    waiters: HashMap<OperationId, oneshot::Sender<Result<Value>>>,
    executing: usize,
    next_seq: u64,
    history: VecDeque<Operation>,
    closed: bool,
}

impl QueueState {
    fn retire(&mut self, op: Operation) {
        self.history.push_back(op);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn find(&self, id: &OperationId) -> Option<&Operation> {
        self.operations
            .get(id)
            .or_else(|| self.history.iter().rev().find(|op| op.id == *id))
    }
}

struct Dispatch {
    id: OperationId,
    service: ServiceId,
    name: OperationName,
    params: Value,
    handler: Result<Handler>,
    timeout: Duration,
}

/// Concurrency-capped priority dispatcher.
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    state: Arc<Mutex<QueueState>>,
    services: Arc<RwLock<ServiceDirectory>>,
    health: Arc<RwLock<ServiceHealthRegistry>>,
    events: EventBus,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
}

impl OperationQueue {
    /// Create an empty queue.
    ///
    /// # Arguments
    ///
    /// * `services` - Handler tables operations are validated and dispatched against
    /// * `health` - Registry gating dispatch and receiving outcomes
    /// * `events` - Bus for `operation.updated` events
    /// * `config` - Concurrency cap, queue cap and timeouts
    /// * `clock` - Time source for operation timestamps
    pub fn new(
        services: Arc<RwLock<ServiceDirectory>>,
        health: Arc<RwLock<ServiceHealthRegistry>>,
        events: EventBus,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            services,
            health,
            events,
            config,
            clock,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Submit an operation.
    ///
    /// Returns immediately with a ticket; the operation runs on a later
    /// dispatch tick.
    ///
    /// # Errors
    /// - `ServiceNotFound` / `OperationNotSupported` if the service or the
    ///   operation is not registered
    /// - `QueueFull` if `max_queue_len` operations are already waiting
    /// - `Cancelled` after `shutdown`
    pub async fn enqueue(
        &self,
        service: &ServiceId,
        operation: &OperationName,
        params: Value,
        priority: Priority,
    ) -> Result<OperationTicket> {
        self.services.read().await.resolve(service, operation)?;

        let (tx, rx) = oneshot::channel();
        let event = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return Err(Error::Cancelled);
            }
            let capacity = self.config.max_queue_len;
            if capacity > 0 && state.pending.len() >= capacity {
                return Err(Error::QueueFull { capacity });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let op = Operation {
                id: OperationId::new(),
                service: service.clone(),
                name: operation.clone(),
                params,
                status: OperationStatus::Queued,
                priority,
                enqueued_at: self.clock.now(),
                started_at: None,
                ended_at: None,
                result: None,
                error: None,
                seq,
            };
            let event = OperationEvent::from(&op);
            state.pending.insert((Reverse(priority), seq), op.id);
            state.waiters.insert(op.id, tx);
            state.operations.insert(op.id, op);
            event
        };

        aplog_debug!(
            "queue: enqueued {} {}.{} ({:?})",
            event.operation_id.short(),
            service,
            operation,
            priority
        );
        let id = event.operation_id;
        self.events.publish_operation(event);
        self.wake.notify_one();
        Ok(OperationTicket { id, rx })
    }

    /// Run one dispatch pass.
    ///
    /// Fails queued operations that exceeded `queued_timeout_ms` behind an
    /// unavailable service, then starts as many available operations as
    /// the free capacity allows.
    ///
    /// Returns the number of operations started.
    pub async fn dispatch_tick(&self) -> usize {
        let services = self.services.read().await;
        let health = self.health.read().await;
        let now = self.clock.now();

        let mut expired = Vec::new();
        let mut jobs = Vec::new();
        let mut started = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if let Some(limit) = self.config.queued_timeout() {
                let stale: Vec<_> = state
                    .pending
                    .iter()
                    .filter(|(_, id)| {
                        state.operations.get(*id).is_some_and(|op| {
                            !health.is_available(&op.service)
                                && elapsed_between(op.enqueued_at, now) >= limit
                        })
                    })
                    .map(|(key, id)| (*key, *id))
                    .collect();

                for (key, id) in stale {
                    state.pending.remove(&key);
                    let Some(mut op) = state.operations.remove(&id) else {
                        continue;
                    };
                    let error = Error::ServiceUnavailable {
                        service: op.service.clone(),
                    };
                    op.status = OperationStatus::Failed;
                    op.ended_at = Some(now);
                    op.error = Some(error.to_string());
                    expired.push((OperationEvent::from(&op), state.waiters.remove(&id), error));
                    state.retire(op);
                }
            }

            let free = self
                .config
                .max_concurrent_operations
                .saturating_sub(state.executing);
            let selected: Vec<_> = state
                .pending
                .iter()
                .filter(|(_, id)| {
                    state
                        .operations
                        .get(*id)
                        .is_some_and(|op| health.is_available(&op.service))
                })
                .take(free)
                .map(|(key, id)| (*key, *id))
                .collect();

            for (key, id) in selected {
                state.pending.remove(&key);
                let Some(op) = state.operations.get_mut(&id) else {
                    continue;
                };
                op.status = OperationStatus::Executing;
                op.started_at = Some(now);
                state.executing += 1;

                let timeout = services
                    .get(&op.service)
                    .and_then(|s| s.timeout())
                    .unwrap_or_else(|| self.config.timeout_for(op.service.as_str()));
                jobs.push(Dispatch {
                    id,
                    service: op.service.clone(),
                    name: op.name.clone(),
                    params: op.params.clone(),
                    handler: services.resolve(&op.service, &op.name),
                    timeout,
                });
                started.push(OperationEvent::from(&*op));
            }
        }
        drop(health);
        drop(services);

        for (event, waiter, error) in expired {
            aplog_warn!(
                "queue: {} expired waiting for {}",
                event.operation_id.short(),
                event.service
            );
            self.events.publish_operation(event);
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(error));
            }
        }
        for event in started {
            self.events.publish_operation(event);
        }

        let count = jobs.len();
        for job in jobs {
            self.spawn_call(job);
        }
        count
    }

    fn spawn_call(&self, job: Dispatch) {
        let queue = self.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let result = match job.handler {
                Ok(handler) => {
                    let mut call = tokio::spawn(handler(job.params));
                    match tokio::time::timeout(job.timeout, &mut call).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(e)) => Err(Error::TaskJoin(e.to_string())),
                        Err(_) => {
                            call.abort();
                            Err(Error::OperationTimeout {
                                service: job.service.clone(),
                                operation: job.name.clone(),
                                timeout: job.timeout,
                            })
                        }
                    }
                }
                Err(e) => Err(e),
            };
            queue
                .finish(job.id, &job.service, result, started.elapsed())
                .await;
        });
    }

    async fn finish(
        &self,
        id: OperationId,
        service: &ServiceId,
        result: Result<Value>,
        latency: Duration,
    ) {
        let now = self.clock.now();
        let success = result.is_ok();
        let (event, waiter) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.executing = state.executing.saturating_sub(1);

            match state.operations.remove(&id) {
                Some(mut op) => {
                    op.ended_at = Some(now);
                    // A cancelled call's late result does not change its status.
                    let event = if op.status == OperationStatus::Cancelled {
                        None
                    } else {
                        match &result {
                            Ok(value) => {
                                op.status = OperationStatus::Completed;
                                op.result = Some(value.clone());
                            }
                            Err(e) => {
                                op.status = OperationStatus::Failed;
                                op.error = Some(e.to_string());
                            }
                        }
                        Some(OperationEvent::from(&op))
                    };
                    state.retire(op);
                    (event, state.waiters.remove(&id))
                }
                None => (None, None),
            }
        };

        let latency_ms = latency.as_secs_f64() * 1000.0;
        if let Err(e) = self
            .health
            .write()
            .await
            .report_outcome(service, success, latency_ms)
        {
            aplog_debug!("queue: outcome for {} not recorded: {}", service, e);
        }

        if let Some(event) = event {
            aplog_debug!("queue: {} {}", event.operation_id.short(), event.status);
            self.events.publish_operation(event);
        }
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
        self.wake.notify_one();
    }

    /// Cancel a queued or executing operation.
    ///
    /// A queued operation leaves the queue. An executing call is not
    /// interrupted; it is marked cancelled and its late result is discarded.
    /// Returns `false` for unknown or already terminal operations.
    pub async fn cancel(&self, id: OperationId) -> bool {
        let now = self.clock.now();
        let (event, waiter) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let status = match state.operations.get(&id) {
                Some(op) => op.status,
                None => return false,
            };

            match status {
                OperationStatus::Queued => {
                    let Some(mut op) = state.operations.remove(&id) else {
                        return false;
                    };
                    state.pending.remove(&(Reverse(op.priority), op.seq));
                    op.status = OperationStatus::Cancelled;
                    op.ended_at = Some(now);
                    let event = OperationEvent::from(&op);
                    state.retire(op);
                    (event, state.waiters.remove(&id))
                }
                OperationStatus::Executing => {
                    let Some(op) = state.operations.get_mut(&id) else {
                        return false;
                    };
                    op.status = OperationStatus::Cancelled;
                    let event = OperationEvent::from(&*op);
                    (event, state.waiters.remove(&id))
                }
                _ => return false,
            }
        };

        aplog_debug!("queue: cancelled {}", id.short());
        self.events.publish_operation(event);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(Error::Cancelled));
        }
        true
    }

    /// Current record of an active or recently finished operation.
    pub async fn status(&self, id: OperationId) -> Option<Operation> {
        self.state.lock().await.find(&id).cloned()
    }

    /// Stop accepting operations and cancel everything still queued.
    ///
    /// In-flight calls are left to finish. Returns the number of queued
    /// operations that were cancelled.
    pub async fn shutdown(&self) -> usize {
        let now = self.clock.now();
        let cancelled = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.closed = true;

            let pending = std::mem::take(&mut state.pending);
            let mut cancelled = Vec::with_capacity(pending.len());
            for id in pending.into_values() {
                let Some(mut op) = state.operations.remove(&id) else {
                    continue;
                };
                op.status = OperationStatus::Cancelled;
                op.ended_at = Some(now);
                cancelled.push((OperationEvent::from(&op), state.waiters.remove(&id)));
                state.retire(op);
            }
            cancelled
        };

        let count = cancelled.len();
        for (event, waiter) in cancelled {
            self.events.publish_operation(event);
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(Error::Cancelled));
            }
        }
        if count > 0 {
            aplog_debug!("queue: shutdown cancelled {} queued operations", count);
        }
        count
    }

    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn executing_count(&self) -> usize {
        self.state.lock().await.executing
    }

    /// Notified on every enqueue and completion, so a driving loop can
    /// dispatch without waiting for the next tick.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Dispatch loop: runs a pass on every wake-up and at least once per
    /// `dispatch_interval_ms`, until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let tick = self.config.dispatch_interval();
        loop {
            self.dispatch_tick().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
        aplog_debug!("queue: dispatch loop stopped");
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field(
                "max_concurrent_operations",
                &self.config.max_concurrent_operations,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, SystemClock};
    use crate::orchestration::service::Service;
    use serde_json::json;

    struct Harness {
        queue: OperationQueue,
        health: Arc<RwLock<ServiceHealthRegistry>>,
        order: Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn harness_with(config: Config, clock: Arc<dyn Clock>) -> Harness {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&order);
        let service = Service::new("worker", "Worker")
            .operation("echo", |params| async move { Ok(params) })
            .operation("record", move |params| {
                let recorded = Arc::clone(&recorded);
                async move {
                    let label = params["label"].as_str().unwrap_or_default().to_string();
                    recorded.lock().unwrap().push(label);
                    Ok(Value::Null)
                }
            })
            .operation("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            })
            .operation("fail", |_| async { Err(Error::Worker("boom".into())) });

        let mut directory = ServiceDirectory::new();
        directory.register(service).unwrap();
        let mut registry = ServiceHealthRegistry::from_config(&config);
        registry.register(ServiceId::from("worker"), "Worker", false, vec![], clock.now());

        let health = Arc::new(RwLock::new(registry));
        let queue = OperationQueue::new(
            Arc::new(RwLock::new(directory)),
            Arc::clone(&health),
            EventBus::default(),
            Arc::new(config),
            clock,
        );
        Harness {
            queue,
            health,
            order,
        }
    }

    fn harness(max_concurrent: usize) -> Harness {
        let config = Config {
            max_concurrent_operations: max_concurrent,
            ..Config::default()
        };
        harness_with(config, Arc::new(SystemClock))
    }

    fn worker() -> ServiceId {
        ServiceId::from("worker")
    }

    async fn settle(queue: &OperationQueue) {
        while queue.executing_count().await > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn test_operation_id_short() {
        assert_eq!(OperationId::new().short().len(), 8);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unknown_targets() {
        let h = harness(1);
        let unknown_service = h
            .queue
            .enqueue(&"nope".into(), &"echo".into(), Value::Null, Priority::Low)
            .await;
        assert!(matches!(unknown_service, Err(Error::ServiceNotFound(_))));

        let unknown_op = h
            .queue
            .enqueue(&worker(), &"teleport".into(), Value::Null, Priority::Low)
            .await;
        assert!(matches!(
            unknown_op,
            Err(Error::OperationNotSupported { .. })
        ));
        assert_eq!(h.queue.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_and_complete() {
        let h = harness(2);
        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), json!({"n": 7}), Priority::Medium)
            .await
            .unwrap();
        let id = ticket.id();

        assert_eq!(h.queue.dispatch_tick().await, 1);
        assert_eq!(ticket.wait().await.unwrap(), json!({"n": 7}));

        let op = h.queue.status(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.started_at.is_some());
        assert!(op.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_priority_then_fifo_dispatch_order() {
        let h = harness(1);
        let mut tickets = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("high", Priority::High),
            ("medium", Priority::Medium),
            ("high-2", Priority::High),
        ] {
            tickets.push(
                h.queue
                    .enqueue(&worker(), &"record".into(), json!({ "label": label }), priority)
                    .await
                    .unwrap(),
            );
        }

        for _ in 0..4 {
            assert_eq!(h.queue.dispatch_tick().await, 1);
            settle(&h.queue).await;
        }
        for ticket in tickets {
            assert!(ticket.wait().await.is_ok());
        }

        let order = h.order.lock().unwrap().clone();
        assert_eq!(order, vec!["high", "high-2", "medium", "low"]);
    }

    #[tokio::test]
    async fn test_capacity_limits_dispatch() {
        let h = harness(2);
        for _ in 0..3 {
            h.queue
                .enqueue(&worker(), &"slow".into(), Value::Null, Priority::Medium)
                .await
                .unwrap();
        }
        assert_eq!(h.queue.dispatch_tick().await, 2);
        assert_eq!(h.queue.executing_count().await, 2);
        assert_eq!(h.queue.queued_len().await, 1);
        assert_eq!(h.queue.dispatch_tick().await, 0);
    }

    #[tokio::test]
    async fn test_failure_reports_to_health() {
        let h = harness(1);
        let ticket = h
            .queue
            .enqueue(&worker(), &"fail".into(), Value::Null, Priority::Medium)
            .await
            .unwrap();
        h.queue.dispatch_tick().await;

        assert!(matches!(ticket.wait().await, Err(Error::Worker(_))));
        assert_eq!(h.health.read().await.get(&worker()).unwrap().error_rate, 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_operation() {
        let mut config = Config {
            max_concurrent_operations: 1,
            ..Config::default()
        };
        config.per_service_timeout_ms.insert("worker".into(), 100);
        let h = harness_with(config, Arc::new(SystemClock));

        let ticket = h
            .queue
            .enqueue(&worker(), &"slow".into(), Value::Null, Priority::Medium)
            .await
            .unwrap();
        let id = ticket.id();
        h.queue.dispatch_tick().await;

        match ticket.wait().await {
            Err(Error::OperationTimeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(100))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(
            h.queue.status(id).await.unwrap().status,
            OperationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_is_idempotent() {
        let h = harness(1);
        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Medium)
            .await
            .unwrap();
        let id = ticket.id();

        assert!(h.queue.cancel(id).await);
        assert!(!h.queue.cancel(id).await);
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
        assert_eq!(h.queue.queued_len().await, 0);
        assert_eq!(h.queue.dispatch_tick().await, 0);
        assert_eq!(
            h.queue.status(id).await.unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_executing_keeps_capacity_until_return() {
        let h = harness(1);
        let ticket = h
            .queue
            .enqueue(&worker(), &"slow".into(), Value::Null, Priority::Medium)
            .await
            .unwrap();
        let id = ticket.id();
        h.queue.dispatch_tick().await;

        assert!(h.queue.cancel(id).await);
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));
        assert_eq!(h.queue.executing_count().await, 1);
        assert!(!h.queue.cancel(id).await);
    }

    #[tokio::test]
    async fn test_cancel_unknown_operation() {
        let h = harness(1);
        assert!(!h.queue.cancel(OperationId::new()).await);
    }

    #[tokio::test]
    async fn test_unavailable_service_stays_queued() {
        let h = harness(1);
        h.health.write().await.mark_offline(&worker()).unwrap();
        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), json!(1), Priority::High)
            .await
            .unwrap();

        assert_eq!(h.queue.dispatch_tick().await, 0);
        assert_eq!(h.queue.queued_len().await, 1);

        h.health
            .write()
            .await
            .mark_online(&worker(), Utc::now())
            .unwrap();
        assert_eq!(h.queue.dispatch_tick().await, 1);
        assert_eq!(ticket.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_queued_timeout_expires_operations() {
        let clock = ManualClock::default();
        let config = Config {
            queued_timeout_ms: Some(1000),
            ..Config::default()
        };
        let h = harness_with(config, Arc::new(clock.clone()));
        h.health.write().await.mark_offline(&worker()).unwrap();

        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Medium)
            .await
            .unwrap();
        h.queue.dispatch_tick().await;
        assert_eq!(h.queue.queued_len().await, 1);

        clock.advance(Duration::from_secs(2));
        h.queue.dispatch_tick().await;
        assert!(matches!(
            ticket.wait().await,
            Err(Error::ServiceUnavailable { .. })
        ));
        assert_eq!(h.queue.queued_len().await, 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let config = Config {
            max_queue_len: 2,
            ..Config::default()
        };
        let h = harness_with(config, Arc::new(SystemClock));
        for _ in 0..2 {
            h.queue
                .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Low)
                .await
                .unwrap();
        }
        let result = h
            .queue
            .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Low)
            .await;
        assert!(matches!(result, Err(Error::QueueFull { capacity: 2 })));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued() {
        let h = harness(1);
        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Low)
            .await
            .unwrap();

        assert_eq!(h.queue.shutdown().await, 1);
        assert!(matches!(ticket.wait().await, Err(Error::Cancelled)));

        let after = h
            .queue
            .enqueue(&worker(), &"echo".into(), Value::Null, Priority::Low)
            .await;
        assert!(matches!(after, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_operation_events_follow_lifecycle() {
        let h = harness(1);
        let mut rx = h.queue.events.subscribe_operations();
        let ticket = h
            .queue
            .enqueue(&worker(), &"echo".into(), json!("hi"), Priority::Low)
            .await
            .unwrap();
        h.queue.dispatch_tick().await;
        ticket.wait().await.unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name(), "operation.updated");
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Queued,
                OperationStatus::Executing,
                OperationStatus::Completed
            ]
        );
    }
}
