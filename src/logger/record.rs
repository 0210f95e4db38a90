//! Log records and the pipe-delimited line format shared by every sink.
//!
//! `2025-01-01 12:00:00 | irondome.disk | WARNING | Possible disk read abuse ...`

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Timestamp layout used at the head of every line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Severity of a record, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Per-event detail (individual reads, RSS samples).
    Debug,
    /// Lifecycle milestones.
    Info,
    /// Alerts and degraded-but-running conditions.
    Warning,
    /// Failures that end the current operation.
    Error,
    /// Failures that end the process.
    Critical,
}

impl Level {
    /// Upper-case label as written to the log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// One formatted log line before it reaches a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub logger: String,
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    /// Create a record stamped with the current local time.
    pub fn new(logger: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            logger: logger.into(),
            level,
            message: message.into(),
        }
    }

    /// Render as `timestamp | logger-name | level | message` (no newline).
    #[must_use]
    pub fn format_line(&self) -> String {
        format!(
            "{} | {} | {} | {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.logger,
            self.level,
            single_line(&self.message),
        )
    }
}

/// Keep one record per line even if a message carries embedded newlines.
fn single_line(message: &str) -> std::borrow::Cow<'_, str> {
    if message.contains(['\n', '\r']) {
        std::borrow::Cow::Owned(message.replace(['\n', '\r'], " "))
    } else {
        std::borrow::Cow::Borrowed(message)
    }
}
