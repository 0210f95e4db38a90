//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use irondome::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, MemoryGuardMode};
pub use crate::core::errors::{ErrorCategory, IronDomeError, Result};
pub use crate::core::paths::{PathKind, WatchSet, WatchedPath};

// Platform
pub use crate::platform::pal::{Platform, ProcessMemory, detect_platform};

// Monitor
pub use crate::monitor::aggregator::{Owner, ReadRateAggregator, RecordOutcome};
pub use crate::monitor::evaluator::{Alert, AlertSink, ThresholdEvaluator};
pub use crate::monitor::events::{EventSource, FsEvent, FsEventKind};

// Daemon
pub use crate::daemon::loop_main::{DaemonSummary, MonitoringDaemon};
pub use crate::daemon::memory_guard::{MemoryGuard, MemoryLimiter};
pub use crate::daemon::signals::ShutdownSignal;

// Logger
pub use crate::logger::dual::{DualLoggerConfig, LoggerHandle, spawn_logger};
pub use crate::logger::record::Level;
