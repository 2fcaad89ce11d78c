use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{aplog_debug, Error, Result};

/// Orchestrator configuration.
///
/// Every field has a default, so a partial TOML file only needs the keys
/// it wants to override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Interval between service health checks.
    pub health_check_interval_ms: u64,
    /// Interval between goal reviews (overrun detection and goal synthesis).
    pub planning_interval_ms: u64,
    /// Interval between historical statistics recomputations.
    pub optimization_interval_ms: u64,
    /// Backstop interval for the operation dispatch loop.
    pub dispatch_interval_ms: u64,
    /// Maximum number of operations executing at once.
    pub max_concurrent_operations: usize,
    /// Maximum number of queued operations; 0 means unbounded.
    pub max_queue_len: usize,
    /// Call timeout for services without an explicit override.
    pub default_timeout_ms: u64,
    /// Per-service call timeout overrides, keyed by service id.
    pub per_service_timeout_ms: HashMap<String, u64>,
    /// Fail operations that stayed queued behind an unavailable service this long.
    pub queued_timeout_ms: Option<u64>,
    /// Re-initialize offline essential services in the background.
    pub auto_recovery: bool,
    /// Healthy fraction below which an emergency is signalled.
    pub emergency_shutdown_threshold: f64,
    /// Smoothing factor for the rolling health metrics.
    pub health_smoothing: f64,
    /// Consecutive failures after which a service is classified critical.
    pub critical_consecutive_failures: u32,
    /// Maximum time a step waits for its dependencies.
    pub dependency_timeout_ms: u64,
    /// Poll interval while waiting for dependencies.
    pub dependency_poll_ms: u64,
    /// Concurrent step cap for the adaptive strategy.
    pub adaptive_parallelism: usize,
    /// Number of open goals the planner keeps in flight.
    pub target_active_goals: usize,
    /// Elapsed/estimated ratio after which an active goal is paused.
    pub overrun_factor: f64,
    /// Delay used by the default retry contingency.
    pub retry_delay_ms: u64,
    /// Worker service per step type, used by goal decomposition.
    pub workers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            planning_interval_ms: 300_000,
            optimization_interval_ms: 600_000,
            dispatch_interval_ms: 1_000,
            max_concurrent_operations: 5,
            max_queue_len: 1024,
            default_timeout_ms: 30_000,
            per_service_timeout_ms: HashMap::new(),
            queued_timeout_ms: None,
            auto_recovery: true,
            emergency_shutdown_threshold: 0.1,
            health_smoothing: 0.1,
            critical_consecutive_failures: 5,
            dependency_timeout_ms: 300_000,
            dependency_poll_ms: 1_000,
            adaptive_parallelism: 2,
            target_active_goals: 2,
            overrun_factor: 2.0,
            retry_delay_ms: 1_000,
            workers: HashMap::new(),
        }
    }
}

impl Config {
    pub fn autopilot_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".autopilot"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::autopilot_dir()?.join("autopilot.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        aplog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            aplog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        aplog_debug!(
            "Config loaded: max_concurrent={}, auto_recovery={}, threshold={}",
            config.max_concurrent_operations,
            config.auto_recovery,
            config.emergency_shutdown_threshold
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                aplog_debug!("Creating config directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        aplog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_operations == 0 {
            return Err(Error::Config(
                "max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.emergency_shutdown_threshold) {
            return Err(Error::Config(format!(
                "emergency_shutdown_threshold must be within [0, 1], got {}",
                self.emergency_shutdown_threshold
            )));
        }
        if !(self.health_smoothing > 0.0 && self.health_smoothing <= 1.0) {
            return Err(Error::Config(format!(
                "health_smoothing must be within (0, 1], got {}",
                self.health_smoothing
            )));
        }
        let intervals = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("planning_interval_ms", self.planning_interval_ms),
            ("optimization_interval_ms", self.optimization_interval_ms),
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("dependency_poll_ms", self.dependency_poll_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.overrun_factor <= 0.0 {
            return Err(Error::Config("overrun_factor must be positive".to_string()));
        }
        Ok(())
    }

    /// Call timeout for a service, falling back to the default.
    pub fn timeout_for(&self, service_id: &str) -> Duration {
        let ms = self
            .per_service_timeout_ms
            .get(service_id)
            .copied()
            .unwrap_or(self.default_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn planning_interval(&self) -> Duration {
        Duration::from_millis(self.planning_interval_ms)
    }

    pub fn optimization_interval(&self) -> Duration {
        Duration::from_millis(self.optimization_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn dependency_poll(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_ms)
    }

    pub fn queued_timeout(&self) -> Option<Duration> {
        self.queued_timeout_ms.map(Duration::from_millis)
    }
}
