//! File logging for the autopilot orchestrator.
//!
//! Messages go to `~/.autopilot/autopilot.log` once `init` has run; before
//! that every macro is a no-op, so embedding the library stays silent.
//!
//! The threshold is INFO, DEBUG with `--debug` or `AUTOPILOT_DEBUG=1`, and
//! `AUTOPILOT_LOG=<level>` overrides both (the only way to reach TRACE).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Pick the threshold from the CLI flag and the environment.
fn threshold_from(debug: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging to `~/.autopilot/autopilot.log`, truncating any previous run.
pub fn init(debug: bool) {
    let level = threshold_from(
        debug,
        std::env::var("AUTOPILOT_DEBUG").ok().as_deref(),
        std::env::var("AUTOPILOT_LOG").ok().as_deref(),
    );
    THRESHOLD.store(level as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".autopilot")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("autopilot.log");
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// Whether a message at `level` would be written.
pub fn enabled(level: LogLevel) -> bool {
    LOG_PATH.get().is_some() && level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __aplog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::log_at($level, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! aplog {
    ($($arg:tt)*) => {
        $crate::__aplog_at!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! aplog_error {
    ($($arg:tt)*) => {
        $crate::__aplog_at!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! aplog_warn {
    ($($arg:tt)*) => {
        $crate::__aplog_at!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! aplog_debug {
    ($($arg:tt)*) => {
        $crate::__aplog_at!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! aplog_trace {
    ($($arg:tt)*) => {
        $crate::__aplog_at!($crate::log::LogLevel::Trace, $($arg)*)
    };
}
