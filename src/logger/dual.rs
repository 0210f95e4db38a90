//! Dual-sink coordinator: every record goes to the rotating file and the console.
//!
//! Architecture: a dedicated logger thread owns the `RotatingFileWriter` and the
//! stderr sink. All other threads send `ActivityEvent` via a bounded crossbeam
//! channel. Non-blocking `try_send()` ensures the event pump and tick loops are
//! never blocked by logging back-pressure.

#![allow(missing_docs)]

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{IronDomeError, Result};
use crate::logger::record::{Level, LogRecord};
use crate::logger::rotating::{RotatingFileConfig, RotatingFileWriter};
use crate::monitor::evaluator::Alert;
use crate::platform::pal::AddressSpaceLimit;

// ──────────────────── logger names ────────────────────

pub const LOGGER_DAEMON: &str = "irondome.daemon";
pub const LOGGER_DISK: &str = "irondome.disk";
pub const LOGGER_MEMORY: &str = "irondome.memory";
pub const LOGGER_SIGNALS: &str = "irondome.signals";

/// How long the logger thread idles before retrying a degraded file sink.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

// ──────────────────── public event type ────────────────────

/// Events that can be logged through the coordinator.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        watched_paths: Vec<PathBuf>,
        read_limit: u64,
        window_ms: u64,
        memory_mode: String,
        memory_limit_mb: u64,
    },
    ReadMonitorRunning,
    WatchEstablished {
        path: PathBuf,
        recursive: bool,
    },
    WatchSkipped {
        path: PathBuf,
        reason: String,
    },
    WatchDropped {
        path: PathBuf,
        reason: String,
    },
    ReadObserved {
        path: PathBuf,
        user: String,
    },
    OwnerLookupFailed {
        path: PathBuf,
        details: String,
    },
    ReadAbuse(Alert),
    EventsDropped {
        count: u64,
    },
    MemoryUsage {
        rss_bytes: u64,
    },
    MemoryBreach {
        usage_bytes: u64,
        limit_mb: u64,
        mode: String,
    },
    MemoryCapInstalled {
        requested_mb: u64,
        /// Limits actually in force after the request was applied.
        limit: AddressSpaceLimit,
    },
    ShutdownRequested {
        source: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
        events_seen: u64,
        reads_counted: u64,
        alerts: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Pre-built record, for messages with no dedicated variant.
    Record(LogRecord),
    /// Write everything queued so far to disk, then acknowledge.
    Flush(Sender<()>),
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Level the event is logged at. Control messages report `Critical` so
    /// they are never filtered.
    pub fn level(&self) -> Level {
        match self {
            Self::ReadObserved { .. }
            | Self::OwnerLookupFailed { .. }
            | Self::MemoryUsage { .. }
            | Self::WatchEstablished { .. } => Level::Debug,
            Self::DaemonStarted { .. }
            | Self::ReadMonitorRunning
            | Self::MemoryCapInstalled { .. }
            | Self::ShutdownRequested { .. }
            | Self::DaemonStopped { .. } => Level::Info,
            Self::WatchSkipped { .. }
            | Self::WatchDropped { .. }
            | Self::ReadAbuse(_)
            | Self::EventsDropped { .. } => Level::Warning,
            Self::Error { .. } => Level::Error,
            Self::MemoryBreach { .. } | Self::Flush(_) | Self::Shutdown => Level::Critical,
            Self::Record(record) => record.level,
        }
    }
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable handle for sending log events.
///
/// Internally wraps a bounded crossbeam `Sender`. The `send()` method uses
/// `try_send()` so callers are never blocked by logging back-pressure.
#[derive(Clone)]
pub struct LoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
    min_level: Arc<AtomicU8>,
}

impl LoggerHandle {
    /// Send an event to the logger thread. Non-blocking.
    ///
    /// Events below the configured level are discarded here, before they
    /// cost a channel slot. If the channel is full the event is dropped and
    /// the dropped-events counter is incremented.
    pub fn send(&self, event: ActivityEvent) {
        if !self.enabled(event.level()) {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Log a free-form message under `logger`.
    pub fn log(&self, logger: &str, level: Level, message: impl Into<String>) {
        self.send(ActivityEvent::Record(LogRecord::new(logger, level, message)));
    }

    /// Whether records at `level` reach the sinks.
    pub fn enabled(&self, level: Level) -> bool {
        level as u8 >= self.min_level.load(Ordering::Relaxed)
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Block until everything queued before this call has been written and
    /// synced, or `timeout` elapses. Returns `true` on acknowledgement.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (ack_tx, ack_rx) = bounded::<()>(1);
        if self
            .tx
            .send_timeout(ActivityEvent::Flush(ack_tx), timeout)
            .is_err()
        {
            return false;
        }
        ack_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .is_ok()
    }

    /// Request graceful shutdown of the logger thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// Handle backed by a plain channel instead of a logger thread. The
    /// caller receives the raw events (embedding, tests).
    pub fn channel(min_level: Level, capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
            min_level: Arc::new(AtomicU8::new(min_level as u8)),
        };
        (handle, rx)
    }

    /// Handle whose events go nowhere.
    pub fn disconnected() -> Self {
        Self::channel(Level::Debug, 1).0
    }
}

// ──────────────────── configuration ────────────────────

/// Options for building the logger.
#[derive(Debug, Clone)]
pub struct DualLoggerConfig {
    /// Rotating file sink (always active).
    pub file: RotatingFileConfig,
    /// Mirror records to stderr.
    pub console: bool,
    /// Color the console level column when stderr is a terminal.
    pub color: bool,
    /// Records below this level are discarded.
    pub min_level: Level,
    /// Bounded channel capacity.
    pub channel_capacity: usize,
}

impl Default for DualLoggerConfig {
    fn default() -> Self {
        Self {
            file: RotatingFileConfig::default(),
            console: true,
            color: true,
            min_level: Level::Info,
            channel_capacity: 1024,
        }
    }
}

// ──────────────────── spawn ────────────────────

/// Spawn the logger thread and return a handle.
///
/// The returned handle is `Clone + Send` and can be shared across threads.
/// The logger thread runs until `handle.shutdown()` is called or all senders
/// are dropped.
pub fn spawn_logger(config: DualLoggerConfig) -> Result<(LoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = LoggerHandle {
        tx,
        dropped_events: dropped,
        min_level: Arc::new(AtomicU8::new(config.min_level as u8)),
    };

    let join = thread::Builder::new()
        .name("irondome-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped_clone))
        .map_err(|e| IronDomeError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    fn write(&self, record: &LogRecord) {
        let line = if self.color {
            format!(
                "{} | {} | {} | {}",
                record.timestamp.format(crate::logger::record::TIMESTAMP_FORMAT),
                record.logger,
                colored_level(record.level),
                record.message,
            )
        } else {
            record.format_line()
        };
        let _ = writeln!(io::stderr().lock(), "{line}");
    }
}

#[cfg(feature = "cli")]
fn colored_level(level: Level) -> String {
    use colored::Colorize;
    match level {
        Level::Debug => level.as_str().dimmed().to_string(),
        Level::Info => level.as_str().green().to_string(),
        Level::Warning => level.as_str().yellow().bold().to_string(),
        Level::Error => level.as_str().red().bold().to_string(),
        Level::Critical => level.as_str().white().on_red().bold().to_string(),
    }
}

#[cfg(not(feature = "cli"))]
fn colored_level(level: Level) -> String {
    level.as_str().to_string()
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: DualLoggerConfig, dropped: &AtomicU64) {
    let mut file = RotatingFileWriter::open(config.file);
    let console = config.console.then(|| ConsoleSink {
        color: config.color && io::stderr().is_terminal(),
    });
    let min_level = config.min_level;

    let emit = |file: &mut RotatingFileWriter, record: &LogRecord| {
        if record.level < min_level {
            return;
        }
        file.write_record(record);
        if let Some(console) = &console {
            console.write(record);
        }
    };

    loop {
        let event = match rx.recv_timeout(RECOVERY_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                file.try_recover();
                file.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            emit(
                &mut file,
                &LogRecord::new(
                    LOGGER_DAEMON,
                    Level::Warning,
                    format!("{d} log records dropped due to back-pressure"),
                ),
            );
        }

        match event {
            ActivityEvent::Shutdown => break,
            ActivityEvent::Flush(ack) => {
                file.sync();
                let _ = io::stderr().flush();
                let _ = ack.try_send(());
            }
            other => {
                let record = event_to_record(other);
                emit(&mut file, &record);
                // Keep the file current for tail -f between bursts.
                if rx.is_empty() {
                    file.flush();
                }
            }
        }
    }

    file.sync();
}

// ──────────────────── event conversion ────────────────────

const MIB: f64 = 1024.0 * 1024.0;

/// Describe the address-space cap that is really in force, which may sit
/// below the request when the hard limit is lower.
#[allow(clippy::cast_precision_loss)]
fn cap_message(requested_mb: u64, limit: AddressSpaceLimit) -> String {
    let requested = requested_mb.saturating_mul(1024 * 1024);
    match limit.soft {
        None => format!("Address-space cap of {requested_mb} MB requested, but no limit is in force"),
        Some(soft) if soft < requested => format!(
            "Address-space cap installed at {:.1} MB (requested {requested_mb} MB, clamped to the hard limit)",
            soft as f64 / MIB
        ),
        Some(_) => match limit.hard {
            Some(hard) => format!(
                "Address-space cap installed at {requested_mb} MB (hard limit {:.1} MB)",
                hard as f64 / MIB
            ),
            None => format!("Address-space cap installed at {requested_mb} MB"),
        },
    }
}

#[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
fn event_to_record(event: ActivityEvent) -> LogRecord {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
            watched_paths,
            read_limit,
            window_ms,
            memory_mode,
            memory_limit_mb,
        } => LogRecord::new(
            LOGGER_DAEMON,
            Level::Info,
            format!(
                "irondome {version} started: paths=[{}] read_limit={read_limit} \
                 window={window_ms}ms memory={memory_mode}:{memory_limit_mb}MB config_hash={config_hash}",
                watched_paths
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ),
        ActivityEvent::ReadMonitorRunning => {
            LogRecord::new(LOGGER_DISK, Level::Info, "Running read monitor...")
        }
        ActivityEvent::WatchEstablished { path, recursive } => LogRecord::new(
            LOGGER_DISK,
            Level::Debug,
            format!(
                "Monitoring directory: {}{}",
                path.display(),
                if recursive { " (recursive)" } else { "" }
            ),
        ),
        ActivityEvent::WatchSkipped { path, reason } => LogRecord::new(
            LOGGER_DISK,
            Level::Warning,
            format!("Path '{}' cannot be watched: {reason}. Skipping.", path.display()),
        ),
        ActivityEvent::WatchDropped { path, reason } => LogRecord::new(
            LOGGER_DISK,
            Level::Warning,
            format!(
                "Watch on '{}' dropped: {reason}. Continuing with remaining paths.",
                path.display()
            ),
        ),
        ActivityEvent::ReadObserved { path, user } => LogRecord::new(
            LOGGER_DISK,
            Level::Debug,
            format!("Read operation detected on {} by {user}", path.display()),
        ),
        ActivityEvent::OwnerLookupFailed { path, details } => LogRecord::new(
            LOGGER_DISK,
            Level::Debug,
            format!("Owner lookup failed for {}: {details}", path.display()),
        ),
        ActivityEvent::ReadAbuse(alert) => {
            LogRecord::new(LOGGER_DISK, Level::Warning, alert.to_string())
        }
        ActivityEvent::EventsDropped { count } => LogRecord::new(
            LOGGER_DISK,
            Level::Warning,
            format!("{count} filesystem events dropped; read counts for this window are a lower bound"),
        ),
        ActivityEvent::MemoryUsage { rss_bytes } => LogRecord::new(
            LOGGER_MEMORY,
            Level::Debug,
            format!("Memory usage: {:.2} MB", rss_bytes as f64 / MIB),
        ),
        ActivityEvent::MemoryBreach {
            usage_bytes,
            limit_mb,
            mode,
        } => LogRecord::new(
            LOGGER_MEMORY,
            Level::Critical,
            format!(
                "Memory has exceeded the {limit_mb} MB limit ({:.2} MB in use, {mode}). Shutting down...",
                usage_bytes as f64 / MIB
            ),
        ),
        ActivityEvent::MemoryCapInstalled {
            requested_mb,
            limit,
        } => LogRecord::new(
            LOGGER_MEMORY,
            Level::Info,
            cap_message(requested_mb, limit),
        ),
        ActivityEvent::ShutdownRequested { source } => LogRecord::new(
            LOGGER_SIGNALS,
            Level::Info,
            format!("Received shutdown signal. Stopping... ({source})"),
        ),
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
            events_seen,
            reads_counted,
            alerts,
        } => LogRecord::new(
            LOGGER_DAEMON,
            Level::Info,
            format!(
                "irondome stopped: reason={reason} uptime={uptime_secs}s \
                 events={events_seen} reads={reads_counted} alerts={alerts}"
            ),
        ),
        ActivityEvent::Error { code, message } => {
            LogRecord::new(LOGGER_DAEMON, Level::Error, format!("[{code}] {message}"))
        }
        ActivityEvent::Record(record) => record,
        ActivityEvent::Flush(_) | ActivityEvent::Shutdown => {
            // Handled in the thread loop.
            LogRecord::new(LOGGER_DAEMON, Level::Debug, "logger control message")
        }
    }
}

// ──────────────────── tests ────────────────────
