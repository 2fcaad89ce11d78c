//! Logical-time schedule for periodic orchestrator work.
//!
//! The orchestrator's driving loop feeds elapsed time into a
//! `TimerSchedule` and runs whatever callbacks come due. Tests advance the
//! schedule directly instead of waiting on real intervals.

use std::time::Duration;

use crate::config::Config;

/// The periodic responsibilities of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Operation dispatch backstop tick.
    Dispatch,
    /// Service health classification and auto-recovery.
    HealthCheck,
    /// Goal review: overrun safeguard and goal synthesis.
    Planning,
    /// Historical statistics recomputation.
    Optimization,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::Dispatch => write!(f, "dispatch"),
            TimerKind::HealthCheck => write!(f, "health_check"),
            TimerKind::Planning => write!(f, "planning"),
            TimerKind::Optimization => write!(f, "optimization"),
        }
    }
}

#[derive(Debug, Clone)]
struct TimerEntry {
    kind: TimerKind,
    every: Duration,
    next_due: Duration,
}

/// A set of periodic timers over logical elapsed time.
#[derive(Debug, Clone, Default)]
pub struct TimerSchedule {
    entries: Vec<TimerEntry>,
    now: Duration,
}

impl TimerSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard schedule from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .every(TimerKind::Dispatch, config.dispatch_interval())
            .every(TimerKind::HealthCheck, config.health_check_interval())
            .every(TimerKind::Planning, config.planning_interval())
            .every(TimerKind::Optimization, config.optimization_interval())
    }

    /// Register a timer that first fires one period after the current time.
    ///
    /// Re-registering a kind replaces its period.
    pub fn every(mut self, kind: TimerKind, every: Duration) -> Self {
        let every = every.max(Duration::from_millis(1));
        self.entries.retain(|e| e.kind != kind);
        self.entries.push(TimerEntry {
            kind,
            every,
            next_due: self.now + every,
        });
        self
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Earliest upcoming due time.
    pub fn next_due(&self) -> Option<Duration> {
        self.entries.iter().map(|e| e.next_due).min()
    }

    /// Advance logical time and return the timers that came due.
    ///
    /// A timer that missed several periods fires once; time never moves
    /// backwards.
    pub fn advance_to(&mut self, elapsed: Duration) -> Vec<TimerKind> {
        if elapsed <= self.now {
            return Vec::new();
        }
        self.now = elapsed;

        let mut due = Vec::new();
        for entry in &mut self.entries {
            if entry.next_due <= elapsed {
                due.push(entry.kind);
                while entry.next_due <= elapsed {
                    entry.next_due += entry.every;
                }
            }
        }
        due
    }
}
