//! Service health tracking.
//!
//! The `ServiceHealthRegistry` keeps one `ServiceHealth` record per
//! registered service. Operation completions feed it latency and success
//! samples, which are folded into exponentially weighted metrics; the
//! periodic health check classifies each service from those metrics.
//!
//! The `HealthMonitor` wraps the registry for the orchestrator's health
//! tick. It runs liveness probes, publishes status changes and emergency
//! signals, and re-initializes essential services that went offline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::core::Clock;
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::orchestration::service::{ServiceDirectory, ServiceId};
use crate::util::with_timeout;
use crate::{aplog, aplog_debug, aplog_warn};

/// Error rate at or above which a service is critical.
pub const CRITICAL_ERROR_RATE: f64 = 0.5;

/// Error rate above which a service is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.1;

/// Mean response time above which a service is degraded.
pub const DEGRADED_RESPONSE_MS: f64 = 5000.0;

/// Health classification of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
    Offline,
}

impl ServiceHealthStatus {
    /// Whether operations may be dispatched to a service in this state.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            ServiceHealthStatus::Healthy | ServiceHealthStatus::Degraded
        )
    }
}

impl std::fmt::Display for ServiceHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceHealthStatus::Healthy => write!(f, "healthy"),
            ServiceHealthStatus::Degraded => write!(f, "degraded"),
            ServiceHealthStatus::Critical => write!(f, "critical"),
            ServiceHealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Liveness record for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub id: ServiceId,
    pub name: String,
    pub status: ServiceHealthStatus,
    /// Start of the current uptime period.
    pub up_since: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    /// Exponentially weighted failure rate in [0, 1].
    pub error_rate: f64,
    /// Exponentially weighted response time.
    pub response_time_ms: f64,
    /// Exponentially weighted outcomes per health-check interval.
    pub throughput: f64,
    pub dependencies: Vec<ServiceId>,
    pub essential: bool,
    pub consecutive_failures: u32,
    #[serde(skip)]
    outcomes_since_check: u32,
}

impl ServiceHealth {
    fn new(
        id: ServiceId,
        name: &str,
        essential: bool,
        dependencies: Vec<ServiceId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            status: ServiceHealthStatus::Healthy,
            up_since: now,
            last_check: None,
            error_rate: 0.0,
            response_time_ms: 0.0,
            throughput: 0.0,
            dependencies,
            essential,
            consecutive_failures: 0,
            outcomes_since_check: 0,
        }
    }
}

/// A service moved between health states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub service: ServiceId,
    pub from: ServiceHealthStatus,
    pub to: ServiceHealthStatus,
}

/// Edge-triggered system health signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmergencySignal {
    /// Health fraction fell below the threshold.
    Breach(f64),
    /// Health fraction is back at or above the threshold.
    Recovered(f64),
}

fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    current * (1.0 - alpha) + sample * alpha
}

/// Health records for every registered service.
///
/// # Example
///
/// ```
/// use autopilot::orchestration::{ServiceHealthRegistry, ServiceHealthStatus};
/// use chrono::Utc;
///
/// let mut registry = ServiceHealthRegistry::new(0.1, 5);
/// registry.register("search".into(), "Search", true, vec![], Utc::now());
/// registry.report_outcome(&"search".into(), false, 120.0).unwrap();
///
/// let health = registry.get(&"search".into()).unwrap();
/// assert!((health.error_rate - 0.1).abs() < 1e-12);
/// assert_eq!(health.status, ServiceHealthStatus::Healthy);
/// ```
#[derive(Debug, Clone)]
pub struct ServiceHealthRegistry {
    services: HashMap<ServiceId, ServiceHealth>,
    smoothing: f64,
    critical_consecutive_failures: u32,
    in_breach: bool,
}

impl ServiceHealthRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `smoothing` - EMA smoothing factor applied to every metric sample
    /// * `critical_consecutive_failures` - Consecutive failures that make a
    ///   service critical regardless of its averaged error rate (0 disables)
    pub fn new(smoothing: f64, critical_consecutive_failures: u32) -> Self {
        Self {
            services: HashMap::new(),
            smoothing,
            critical_consecutive_failures,
            in_breach: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.health_smoothing, config.critical_consecutive_failures)
    }

    /// Add a record in the `healthy` state. Re-registering replaces the record.
    pub fn register(
        &mut self,
        id: ServiceId,
        name: &str,
        essential: bool,
        dependencies: Vec<ServiceId>,
        now: DateTime<Utc>,
    ) {
        aplog_debug!("health: registered service {} (essential={})", id, essential);
        let record = ServiceHealth::new(id.clone(), name, essential, dependencies, now);
        self.services.insert(id, record);
    }

    fn record_mut(&mut self, id: &ServiceId) -> Result<&mut ServiceHealth> {
        self.services
            .get_mut(id)
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))
    }

    /// Fold one operation outcome into the service's rolling metrics.
    pub fn report_outcome(&mut self, id: &ServiceId, success: bool, latency_ms: f64) -> Result<()> {
        let alpha = self.smoothing;
        let record = self.record_mut(id)?;

        let sample = if success { 0.0 } else { 1.0 };
        record.error_rate = ema(record.error_rate, sample, alpha);
        record.response_time_ms = ema(record.response_time_ms, latency_ms.max(0.0), alpha);
        record.outcomes_since_check = record.outcomes_since_check.saturating_add(1);
        if success {
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        }
        Ok(())
    }

    /// Classify one service from its metrics.
    ///
    /// An `offline` service stays offline until `mark_online`. A service that
    /// saw no outcomes since the previous check decays toward healthy by one
    /// zero-error sample.
    ///
    /// Returns the status change, if any.
    pub fn run_health_check(
        &mut self,
        id: &ServiceId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>> {
        let alpha = self.smoothing;
        let breaker = self.critical_consecutive_failures;
        let record = self.record_mut(id)?;
        record.last_check = Some(now);

        let outcomes = f64::from(record.outcomes_since_check);
        record.throughput = ema(record.throughput, outcomes, alpha);
        if record.outcomes_since_check == 0 {
            record.error_rate = ema(record.error_rate, 0.0, alpha);
            record.consecutive_failures = 0;
        }
        record.outcomes_since_check = 0;

        if record.status == ServiceHealthStatus::Offline {
            return Ok(None);
        }

        let tripped = breaker > 0 && record.consecutive_failures >= breaker;
        let next = if record.error_rate >= CRITICAL_ERROR_RATE || tripped {
            ServiceHealthStatus::Critical
        } else if record.response_time_ms > DEGRADED_RESPONSE_MS
            || record.error_rate > DEGRADED_ERROR_RATE
        {
            ServiceHealthStatus::Degraded
        } else {
            ServiceHealthStatus::Healthy
        };

        Ok(Self::set_status(record, next))
    }

    fn set_status(record: &mut ServiceHealth, next: ServiceHealthStatus) -> Option<StatusChange> {
        if record.status == next {
            return None;
        }
        let change = StatusChange {
            service: record.id.clone(),
            from: record.status,
            to: next,
        };
        aplog_debug!("health: {} {} -> {}", record.id, change.from, change.to);
        record.status = next;
        Some(change)
    }

    /// Check every service, returning the status changes.
    pub fn run_all(&mut self, now: DateTime<Utc>) -> Vec<StatusChange> {
        let mut ids: Vec<ServiceId> = self.services.keys().cloned().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.run_health_check(id, now).ok().flatten())
            .collect()
    }

    /// Fraction of services that are `healthy`; 1.0 with no services.
    pub fn system_health_fraction(&self) -> f64 {
        if self.services.is_empty() {
            return 1.0;
        }
        let healthy = self
            .services
            .values()
            .filter(|s| s.status == ServiceHealthStatus::Healthy)
            .count();
        healthy as f64 / self.services.len() as f64
    }

    /// Compare the health fraction against `threshold`.
    ///
    /// Emits `Breach` once when the fraction first drops below the threshold
    /// and `Recovered` once when it returns to or above it; repeated calls
    /// in the same state emit nothing.
    pub fn evaluate_emergency(&mut self, threshold: f64) -> Option<EmergencySignal> {
        let fraction = self.system_health_fraction();
        if fraction < threshold {
            if self.in_breach {
                return None;
            }
            self.in_breach = true;
            Some(EmergencySignal::Breach(fraction))
        } else if self.in_breach {
            self.in_breach = false;
            Some(EmergencySignal::Recovered(fraction))
        } else {
            None
        }
    }

    pub fn in_breach(&self) -> bool {
        self.in_breach
    }

    pub fn mark_offline(&mut self, id: &ServiceId) -> Result<Option<StatusChange>> {
        let record = self.record_mut(id)?;
        Ok(Self::set_status(record, ServiceHealthStatus::Offline))
    }

    /// Bring a service back after a successful (re)initialization or probe.
    ///
    /// Leaving `offline` starts a new uptime period and clears the failure
    /// metrics.
    pub fn mark_online(&mut self, id: &ServiceId, now: DateTime<Utc>) -> Result<Option<StatusChange>> {
        let record = self.record_mut(id)?;
        if record.status != ServiceHealthStatus::Offline {
            return Ok(None);
        }
        record.up_since = now;
        record.error_rate = 0.0;
        record.consecutive_failures = 0;
        Ok(Self::set_status(record, ServiceHealthStatus::Healthy))
    }

    /// Whether the service is `healthy` or `degraded`.
    pub fn is_available(&self, id: &ServiceId) -> bool {
        self.services
            .get(id)
            .map(|s| s.status.is_available())
            .unwrap_or(false)
    }

    pub fn get(&self, id: &ServiceId) -> Option<&ServiceHealth> {
        self.services.get(id)
    }

    pub fn status(&self, id: &ServiceId) -> Option<ServiceHealthStatus> {
        self.services.get(id).map(|s| s.status)
    }

    /// All records, sorted by id.
    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let mut records: Vec<_> = self.services.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Essential services that are offline.
    pub fn recovery_candidates(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self
            .services
            .values()
            .filter(|s| s.essential && s.status == ServiceHealthStatus::Offline)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceHealthRegistry {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of one health tick.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub changes: Vec<StatusChange>,
    pub emergency: Option<EmergencySignal>,
    pub health_fraction: f64,
    pub recovered: Vec<ServiceId>,
}

/// Drives the registry from the orchestrator's health tick.
pub struct HealthMonitor {
    registry: Arc<RwLock<ServiceHealthRegistry>>,
    services: Arc<RwLock<ServiceDirectory>>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    ///
    /// # Arguments
    ///
    /// * `registry` - Shared health records
    /// * `services` - Registered services, for probes and re-initialization
    /// * `events` - Bus receiving status-change and emergency events
    /// * `clock` - Time source for check and uptime timestamps
    /// * `config` - Threshold and auto-recovery settings
    pub fn new(
        registry: Arc<RwLock<ServiceHealthRegistry>>,
        services: Arc<RwLock<ServiceDirectory>>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            services,
            events,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<ServiceHealthRegistry>> {
        &self.registry
    }

    /// Run one full health tick.
    ///
    /// Probes run without holding the registry lock. Classification and
    /// the emergency evaluation happen under one write lock, then events
    /// are published and offline essential services are re-initialized.
    pub async fn check_all(&self) -> HealthReport {
        let services = self.services.read().await.all();

        let mut probes = Vec::new();
        for service in &services {
            let timeout = service
                .timeout()
                .unwrap_or_else(|| self.config.timeout_for(service.id().as_str()));
            let probe = async { service.probe().await.transpose() };
            match with_timeout(timeout, probe).await {
                Ok(None) => {}
                Ok(Some(())) => probes.push((service.id().clone(), Ok(()))),
                Err(e) => probes.push((service.id().clone(), Err(e))),
            }
        }

        let now = self.clock.now();
        let mut report = HealthReport::default();
        {
            let mut registry = self.registry.write().await;
            for (id, result) in probes {
                let change = match result {
                    Ok(()) => registry.mark_online(&id, now),
                    Err(e) => {
                        aplog_warn!("health: probe failed for {}: {}", id, e);
                        registry.mark_offline(&id)
                    }
                };
                if let Ok(Some(change)) = change {
                    report.changes.push(change);
                }
            }
            report.changes.extend(registry.run_all(now));
            report.emergency = registry.evaluate_emergency(self.config.emergency_shutdown_threshold);
            report.health_fraction = registry.system_health_fraction();
        }

        for change in &report.changes {
            self.publish_change(change);
        }
        match report.emergency {
            Some(EmergencySignal::Breach(fraction)) => {
                aplog_warn!(
                    "health: system health {:.2} below emergency threshold {:.2}",
                    fraction,
                    self.config.emergency_shutdown_threshold
                );
                self.events.publish_orchestrator(OrchestratorEvent::Emergency {
                    health_fraction: fraction,
                });
            }
            Some(EmergencySignal::Recovered(fraction)) => {
                aplog!("health: system health recovered to {:.2}", fraction);
                self.events.publish_orchestrator(OrchestratorEvent::Recovered {
                    health_fraction: fraction,
                });
            }
            None => {}
        }

        report.recovered = self.recover_offline().await;
        report
    }

    fn publish_change(&self, change: &StatusChange) {
        self.events
            .publish_orchestrator(OrchestratorEvent::ServiceStatusChanged {
                service: change.service.clone(),
                from: change.from,
                to: change.to,
            });
    }

    /// Re-initialize offline essential services when auto-recovery is on.
    ///
    /// Returns the services that came back online.
    pub async fn recover_offline(&self) -> Vec<ServiceId> {
        if !self.config.auto_recovery {
            return Vec::new();
        }

        let candidates = self.registry.read().await.recovery_candidates();
        let mut recovered = Vec::new();
        for id in candidates {
            let Some(service) = self.services.read().await.get(&id) else {
                continue;
            };
            match service.initialize().await {
                Ok(()) => {
                    let now = self.clock.now();
                    let change = self.registry.write().await.mark_online(&id, now);
                    if let Ok(Some(change)) = change {
                        self.publish_change(&change);
                    }
                    aplog!("health: recovered essential service {}", id);
                    recovered.push(id);
                }
                Err(e) => {
                    aplog_warn!("health: re-initialization of {} failed: {}", id, e);
                }
            }
        }
        recovered
    }

    /// Initialize every registered service in dependency order.
    ///
    /// A failing service is marked offline. With auto-recovery disabled, a
    /// failing essential service aborts startup.
    ///
    /// # Errors
    /// Returns `EssentialServiceFailed` for the first essential service that
    /// fails while auto-recovery is disabled.
    pub async fn initialize_services(&self) -> Result<()> {
        let services = self.services.read().await.startup_order();
        for service in services {
            let id = service.id().clone();
            let Err(e) = service.initialize().await else {
                aplog_debug!("health: initialized {}", id);
                continue;
            };

            if service.is_essential() && !self.config.auto_recovery {
                crate::aplog_error!("health: essential service {} failed: {}", id, e);
                return Err(Error::EssentialServiceFailed {
                    service: id,
                    reason: e.to_string(),
                });
            }

            aplog_warn!("health: service {} failed to initialize: {}", id, e);
            let change = self.registry.write().await.mark_offline(&id);
            if let Ok(Some(change)) = change {
                self.publish_change(&change);
            }
        }
        Ok(())
    }
}
