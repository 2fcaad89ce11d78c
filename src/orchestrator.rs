//! The orchestrator root object.
//!
//! `Orchestrator` wires the service directory, health monitor, operation
//! queue and goal executor together around one config, clock and event bus.
//! There is no global instance: build as many as needed with
//! `Orchestrator::builder()`.
//!
//! Periodic work is expressed as a `TimerSchedule`. Tests call `advance`
//! with logical elapsed time; `spawn` runs the same schedule from real time
//! on background tasks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{Clock, SystemClock, TimerKind, TimerSchedule};
use crate::error::Result;
use crate::events::{EventBus, DEFAULT_EVENT_CAPACITY};
use crate::goal::GoalExecutor;
use crate::memory::{InMemoryStore, MemoryStore};
use crate::orchestration::{
    HealthMonitor, OperationQueue, Service, ServiceDirectory, ServiceHealth,
    ServiceHealthRegistry,
};
use crate::{aplog, aplog_debug, aplog_warn};

/// Handle to a running background loop, used for graceful shutdown.
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the loop to shut down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Point-in-time view of service health.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Healthy services as a percentage of all registered services.
    pub health_percentage: f64,
    pub services: Vec<ServiceHealth>,
    pub average_response_ms: f64,
    pub average_error_rate: f64,
    /// Whether the health fraction is currently below the emergency threshold.
    pub in_emergency: bool,
}

/// Builder for `Orchestrator`.
pub struct OrchestratorBuilder {
    config: Config,
    clock: Arc<dyn Clock>,
    memory: Option<Arc<dyn MemoryStore>>,
    services: Vec<Service>,
    event_capacity: usize,
}

impl OrchestratorBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            clock: Arc::new(SystemClock),
            memory: None,
            services: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persistence collaborator; defaults to an `InMemoryStore`.
    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Register a service at build time.
    pub fn service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the config and assemble the orchestrator.
    ///
    /// # Errors
    /// Returns `Config` for an invalid configuration and `Validation` for a
    /// service registered twice.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let clock = self.clock;
        let events = EventBus::new(self.event_capacity);
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let mut directory = ServiceDirectory::new();
        let mut registry = ServiceHealthRegistry::from_config(&config);
        for service in self.services {
            let service = directory.register(service)?;
            registry.register(
                service.id().clone(),
                service.name(),
                service.is_essential(),
                service.dependencies().to_vec(),
                clock.now(),
            );
        }

        let services = Arc::new(RwLock::new(directory));
        let registry = Arc::new(RwLock::new(registry));
        let health = HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&services),
            events.clone(),
            Arc::clone(&clock),
            Arc::clone(&config),
        );
        let queue = OperationQueue::new(
            Arc::clone(&services),
            Arc::clone(&registry),
            events.clone(),
            Arc::clone(&config),
            Arc::clone(&clock),
        );
        let goals = Arc::new(GoalExecutor::new(
            queue.clone(),
            memory,
            events.clone(),
            Arc::clone(&config),
            Arc::clone(&clock),
        ));

        Ok(Orchestrator {
            timers: Mutex::new(TimerSchedule::from_config(&config)),
            config,
            clock,
            events,
            services,
            registry,
            health,
            queue,
            goals,
        })
    }
}

/// Root object owning every orchestration component.
pub struct Orchestrator {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    services: Arc<RwLock<ServiceDirectory>>,
    registry: Arc<RwLock<ServiceHealthRegistry>>,
    health: HealthMonitor,
    queue: OperationQueue,
    goals: Arc<GoalExecutor>,
    timers: Mutex<TimerSchedule>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Register a service after construction. It starts `healthy`.
    pub async fn register_service(&self, service: Service) -> Result<()> {
        let service = self.services.write().await.register(service)?;
        self.registry.write().await.register(
            service.id().clone(),
            service.name(),
            service.is_essential(),
            service.dependencies().to_vec(),
            self.clock.now(),
        );
        Ok(())
    }

    /// Initialize every service in dependency order.
    ///
    /// # Errors
    /// Returns `EssentialServiceFailed` when an essential service fails and
    /// auto-recovery is disabled.
    pub async fn startup(&self) -> Result<()> {
        let count = self.services.read().await.len();
        self.health.initialize_services().await?;
        aplog!("orchestrator: started with {} services", count);
        Ok(())
    }

    /// Advance the logical timer schedule and run every callback that came due.
    ///
    /// Returns the timers that fired, in firing order.
    ///
    /// # Errors
    /// Every due timer runs even when an earlier one fails; the first
    /// failure is returned afterwards.
    pub async fn advance(&self, elapsed: Duration) -> Result<Vec<TimerKind>> {
        let due = self.timers.lock().await.advance_to(elapsed);
        let mut first_error = None;
        for kind in &due {
            if let Err(e) = self.run_timer(*kind).await {
                aplog_warn!("orchestrator: {} tick failed: {}", kind, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(due),
        }
    }

    /// Run one periodic responsibility immediately.
    pub async fn run_timer(&self, kind: TimerKind) -> Result<()> {
        aplog_debug!("orchestrator: {} tick", kind);
        match kind {
            TimerKind::Dispatch => {
                self.queue.dispatch_tick().await;
            }
            TimerKind::HealthCheck => {
                self.health.check_all().await;
            }
            TimerKind::Planning => {
                self.goals.review().await?;
            }
            TimerKind::Optimization => {
                self.goals.optimize().await;
            }
        }
        Ok(())
    }

    pub async fn system_health(&self) -> SystemHealth {
        let registry = self.registry.read().await;
        let services = registry.snapshot();
        let count = services.len().max(1) as f64;
        let average_response_ms = services.iter().map(|s| s.response_time_ms).sum::<f64>() / count;
        let average_error_rate = services.iter().map(|s| s.error_rate).sum::<f64>() / count;
        SystemHealth {
            health_percentage: registry.system_health_fraction() * 100.0,
            services,
            average_response_ms,
            average_error_rate,
            in_emergency: registry.in_breach(),
        }
    }

    /// Run the dispatch loop and the timer schedule on background tasks.
    ///
    /// The timer loop ticks every `dispatch_interval_ms` and feeds real
    /// elapsed time into `advance`. Shutting the handle down stops both
    /// loops and cancels whatever is still queued.
    pub fn spawn(self: &Arc<Self>) -> ActorHandle {
        let cancel = CancellationToken::new();

        let queue = self.queue.clone();
        let token = cancel.child_token();
        tokio::spawn(async move { queue.run(token).await });

        let orchestrator = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(orchestrator.config.dispatch_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        aplog_debug!("orchestrator: driving loop cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = orchestrator.advance(start.elapsed()).await {
                            aplog_warn!("orchestrator: timer failed: {}", e);
                        }
                    }
                }
            }
            orchestrator.shutdown().await;
        });

        ActorHandle::new(cancel)
    }

    /// Cancel every queued operation. Returns how many were cancelled.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.queue.shutdown().await;
        aplog!("orchestrator: shut down, {} queued operations cancelled", cancelled);
        cancelled
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn goals(&self) -> &Arc<GoalExecutor> {
        &self.goals
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn registry(&self) -> &Arc<RwLock<ServiceHealthRegistry>> {
        &self.registry
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}
