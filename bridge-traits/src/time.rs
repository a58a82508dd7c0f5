//! Time and Logging Abstractions
//!
//! Injectable time source (tracker expiries are computed from it) and a sink
//! for mirroring structured logs into the host's logging pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{error::Result, platform::PlatformSendSync};

/// Time source trait
///
/// Every expiry deadline the sync engine persists is derived from this clock,
/// so tests can move time forward instead of sleeping.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::time::Clock;
///
/// fn is_stalled(clock: &dyn Clock, expiry_ms: i64) -> bool {
///     expiry_ms <= clock.unix_timestamp_millis()
/// }
/// ```
pub trait Clock: PlatformSendSync {
    /// Get current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Get current Unix timestamp in milliseconds
    fn unix_timestamp_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Unix timestamp in milliseconds `after` from now.
    fn deadline_after(&self, after: Duration) -> i64 {
        let millis = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
        self.unix_timestamp_millis().saturating_add(millis)
    }
}

/// System clock implementation using actual system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Target module/component
    pub target: String,
    pub message: String,
    /// Structured fields recorded on the event
    pub fields: HashMap<String, String>,
    /// Name of the enclosing span, if any
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            fields: HashMap::new(),
            span: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Logger sink trait
///
/// Forwards structured logs from the core to host logging pipelines
/// (OSLog, Logcat, journald, ...). Implementations are responsible for any
/// host-specific privacy filtering.
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait LoggerSink: PlatformSendSync {
    /// Forward a log entry to the host logging system
    async fn log(&self, entry: LogEntry) -> Result<()>;

    /// Flush any buffered logs
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Logs below this level are dropped before reaching the sink.
    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}
