// logging.rs - Simple, embedded-friendly logging for the transaction engine
// No external logging dependency; everything goes to stderr behind an
// atomically-loaded level so hot paths pay one relaxed load when disabled.

use std::sync::atomic::{AtomicU8, Ordering};

/// Log levels (ordered by severity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Errors - failures that abort an operation or a whole transaction
    Error = 0,
    /// Warnings - recoverable anomalies (cleanup races, retried writes)
    Warn = 1,
    /// Info - transaction lifecycle events
    Info = 2,
    /// Debug - per-protocol-step diagnostics
    Debug = 3,
    /// Trace - every backend round trip
    Trace = 4,
}

impl LogLevel {
    /// Parse log level from string (case-insensitive)
    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_uppercase().as_str() {
            "ERROR" => Some(LogLevel::Error),
            "WARN" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "TRACE" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to string
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

/// Subsystem a message belongs to. The engine keeps three independently
/// adjustable targets: the foreground transaction path and the two
/// background cleanup loops, which tend to be silenced separately in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogTarget {
    /// Driver + attempt context
    Txn = 0,
    /// In-process cleanup queue worker
    AttemptCleanup = 1,
    /// Lost-attempts (cross-client) cleanup workers
    LostCleanup = 2,
}

impl LogTarget {
    fn tag(&self) -> &'static str {
        match self {
            LogTarget::Txn => "txn",
            LogTarget::AttemptCleanup => "cleanup::attempts",
            LogTarget::LostCleanup => "cleanup::lost",
        }
    }
}

// Per-target levels (default: WARN for production)
static TARGET_LEVELS: [AtomicU8; 3] = [
    AtomicU8::new(LogLevel::Warn as u8),
    AtomicU8::new(LogLevel::Warn as u8),
    AtomicU8::new(LogLevel::Warn as u8),
];

fn level_from_u8(level: u8) -> LogLevel {
    match level {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        4 => LogLevel::Trace,
        _ => LogLevel::Warn, // Fallback
    }
}

/// Set the level for every target at once
pub fn set_log_level(level: LogLevel) {
    for target in &TARGET_LEVELS {
        target.store(level as u8, Ordering::Relaxed);
    }
}

/// Set the level for a single target
pub fn set_target_level(target: LogTarget, level: LogLevel) {
    TARGET_LEVELS[target as usize].store(level as u8, Ordering::Relaxed);
}

/// Get the current level of a target
pub fn get_target_level(target: LogTarget) -> LogLevel {
    level_from_u8(TARGET_LEVELS[target as usize].load(Ordering::Relaxed))
}

/// Check if a message at the given level should be logged
#[inline]
pub fn should_log(target: LogTarget, level: LogLevel) -> bool {
    level <= get_target_level(target)
}

/// Internal logging function
#[doc(hidden)]
pub fn log_message(target: LogTarget, level: LogLevel, module: &str, message: &str) {
    if should_log(target, level) {
        eprintln!(
            "[{}] {} {}: {}",
            level.as_str(),
            target.tag(),
            module,
            message
        );
    }
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($target:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $target,
            $crate::logging::LogLevel::Error,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($target:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $target,
            $crate::logging::LogLevel::Warn,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($target:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $target,
            $crate::logging::LogLevel::Info,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($target:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $target,
            $crate::logging::LogLevel::Debug,
            module_path!(),
            &format!($($arg)*)
        )
    };
}

/// Log a trace message
#[macro_export]
macro_rules! log_trace {
    ($target:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $target,
            $crate::logging::LogLevel::Trace,
            module_path!(),
            &format!($($arg)*)
        )
    };
}
