//! Supervisor: builds the pipeline, runs the worker threads, tears them down.
//!
//! Architecture: one process, five threads of our own:
//! - **inotify reader** (`irondome-inotify`): owned by the event source
//! - **Event pump** (`irondome-events`): drains the source channel, attributes
//!   and counts opens, drops watches the OS reports as broken
//! - **Evaluator** (`irondome-evaluator`): closes a window on every tick
//! - **Memory poller** (`irondome-memory`): soft-poll mode only
//! - **Supervisor** (caller's thread): waits on the shutdown signal and checks
//!   that no worker died underneath it
//!
//! A dead worker is not respawned. It ends the process through the normal
//! teardown path.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select, tick};
use serde::Serialize;

use crate::core::config::{Config, MemoryGuardMode};
use crate::core::errors::{IronDomeError, Result};
use crate::core::paths::WatchSet;
use crate::daemon::memory_guard::{MemoryGuard, Terminator, limiter_for};
use crate::daemon::signals::{ShutdownCoordinator, ShutdownReport, ShutdownSignal, join_until};
use crate::logger::dual::{ActivityEvent, LoggerHandle};
use crate::logger::record::Level;
use crate::monitor::aggregator::{AggregatorTotals, Owner, ReadRateAggregator, RecordOutcome};
use crate::monitor::evaluator::ThresholdEvaluator;
use crate::monitor::events::{EventSource, FsEventKind, SourceMessage};
use crate::platform::pal::Platform;

/// How often the supervisor checks worker liveness.
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on messages the pump takes from the channel per batch.
const PUMP_BATCH_MAX: usize = 256;
/// Stack size for pipeline threads; keeps the address space small under a hard cap.
const WORKER_STACK_BYTES: usize = 512 * 1024;

// ──────────────────── summary ────────────────────

/// What a finished run did.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonSummary {
    pub reason: String,
    pub uptime_secs: u64,
    pub totals: AggregatorTotals,
    pub alerts: u64,
    /// The memory guard fired; the caller should exit non-zero.
    pub memory_breached: bool,
    #[serde(skip)]
    pub teardown: ShutdownReport,
}

// ──────────────────── pipeline ────────────────────

/// Per-message work shared by the pump thread and the teardown drain.
struct Pipeline {
    aggregator: Arc<ReadRateAggregator>,
    source: Arc<EventSource>,
    logger: LoggerHandle,
}

impl Pipeline {
    fn handle(&self, message: SourceMessage) {
        match message {
            SourceMessage::Event(event) => {
                if event.kind == FsEventKind::Deleted
                    && self.aggregator.watch_set().position(&event.path).is_some()
                {
                    self.drop_root(event.path.clone(), "watched path was deleted");
                }
                if let RecordOutcome::Counted { owner, .. } = self.aggregator.record(&event) {
                    self.log_read(event.path, owner);
                }
            }
            SourceMessage::WatchError { paths, details } => {
                if paths.is_empty() {
                    self.logger.send(ActivityEvent::Error {
                        code: "IRD-2001".to_string(),
                        message: format!("watcher error: {details}"),
                    });
                }
                for path in paths {
                    let root = self
                        .aggregator
                        .watch_set()
                        .attribute(&path)
                        .map_or(path, |(_, root)| root.path.clone());
                    self.drop_root(root, &details);
                }
            }
        }
    }

    fn drop_root(&self, root: PathBuf, reason: &str) {
        if self.source.retire_root(&root) {
            self.logger.send(ActivityEvent::WatchDropped {
                path: root,
                reason: reason.to_string(),
            });
        }
    }

    fn log_read(&self, path: PathBuf, owner: Owner) {
        if !self.logger.enabled(Level::Debug) {
            return;
        }
        if let Owner::Unknown { reason } = &owner {
            self.logger.send(ActivityEvent::OwnerLookupFailed {
                path: path.clone(),
                details: reason.clone(),
            });
        }
        self.logger.send(ActivityEvent::ReadObserved {
            path,
            user: owner.to_string(),
        });
    }

    /// Consume the channel until shutdown, disconnect, or a failed reservation.
    ///
    /// Each batch is a fresh reservation sized to the backlog, so under a
    /// hard cap a flood of events fails here rather than in the allocator.
    fn pump(&self, rx: &Receiver<SourceMessage>, guard: &MemoryGuard, shutdown: &ShutdownSignal) {
        let stop = shutdown.listener();
        loop {
            let first = select! {
                recv(rx) -> message => match message {
                    Ok(message) => message,
                    Err(_) => return,
                },
                recv(stop) -> _ => return,
            };
            let wanted = (rx.len() + 1).min(PUMP_BATCH_MAX);
            let mut batch: Vec<SourceMessage> = Vec::new();
            if guard.reserve(&mut batch, wanted, "event batch").is_err() {
                return;
            }
            batch.push(first);
            batch.extend(rx.try_iter().take(wanted - 1));
            for message in batch {
                self.handle(message);
            }
        }
    }

    /// Process whatever is still queued. Used once the source has stopped.
    fn drain(&self, rx: &Receiver<SourceMessage>) -> usize {
        let mut drained = 0;
        for message in rx.try_iter() {
            self.handle(message);
            drained += 1;
        }
        drained
    }
}

// ──────────────────── daemon ────────────────────

/// Owns every component of a monitoring run.
pub struct MonitoringDaemon {
    config: Config,
    platform: Arc<dyn Platform>,
    logger: LoggerHandle,
    shutdown: ShutdownSignal,
    aggregator: Arc<ReadRateAggregator>,
    terminator: Option<Terminator>,
    guard: Option<Arc<MemoryGuard>>,
}

impl MonitoringDaemon {
    pub fn new(
        config: Config,
        watch: WatchSet,
        platform: Arc<dyn Platform>,
        logger: LoggerHandle,
        shutdown: ShutdownSignal,
    ) -> Self {
        let aggregator = Arc::new(ReadRateAggregator::new(watch, Arc::clone(&platform)));
        Self {
            config,
            platform,
            logger,
            shutdown,
            aggregator,
            terminator: None,
            guard: None,
        }
    }

    /// Replace the soft-poll exit hook.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = Some(terminator);
        self.guard = None;
        self
    }

    /// The guard this run reserves pipeline buffers through. Built on first
    /// use; `run` arms it.
    pub fn memory_guard(&mut self) -> Arc<MemoryGuard> {
        if let Some(guard) = &self.guard {
            return Arc::clone(guard);
        }
        let mut guard = MemoryGuard::new(
            limiter_for(&self.config.memory, Arc::clone(&self.platform)),
            self.shutdown.clone(),
            self.logger.clone(),
        )
        .with_flush_timeout(self.config.memory.breach_flush_timeout());
        if let Some(terminator) = &self.terminator {
            guard = guard.with_terminator(Arc::clone(terminator));
        }
        let guard = Arc::new(guard);
        self.guard = Some(Arc::clone(&guard));
        guard
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn aggregator(&self) -> Arc<ReadRateAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Monitor until shutdown is requested, then tear down in order.
    ///
    /// Errors are startup failures; nothing is left running when one is
    /// returned.
    #[allow(clippy::too_many_lines)]
    pub fn run(&mut self) -> Result<DaemonSummary> {
        let start_time = Instant::now();
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
            watched_paths: self
                .aggregator
                .watch_set()
                .iter()
                .map(|root| root.path.clone())
                .collect(),
            read_limit: self.config.monitor.read_limit,
            window_ms: self.config.monitor.window_ms,
            memory_mode: self.config.memory.mode.to_string(),
            memory_limit_mb: self.config.memory.limit_mb,
        });

        // 1. Memory guard, before anything else allocates.
        let guard = self.memory_guard();
        guard.arm()?;

        // 2. Subscriptions.
        let (source, rx) = EventSource::start(
            self.aggregator.watch_set(),
            self.config.monitor.event_channel_capacity,
            self.logger.clone(),
        )?;
        let source = Arc::new(source);
        let pipeline = Arc::new(Pipeline {
            aggregator: Arc::clone(&self.aggregator),
            source: Arc::clone(&source),
            logger: self.logger.clone(),
        });
        let evaluator = Arc::new(
            ThresholdEvaluator::new(self.config.monitor.read_limit, self.config.monitor.window())
                .with_drop_reporting(source.dropped_counter(), self.logger.clone()),
        );
        self.logger.send(ActivityEvent::ReadMonitorRunning);

        // 3. Workers.
        let workers = self.spawn_workers(&pipeline, &rx, &guard, &evaluator);
        let (pump, evaluator_join, poller) = match workers {
            Ok(handles) => handles,
            Err(err) => {
                self.shutdown.trigger("startup failure");
                source.stop();
                return Err(err);
            }
        };

        // 4. Supervise.
        while !self.shutdown.wait_timeout(SUPERVISOR_INTERVAL) {
            let dead = if pump.is_finished() {
                Some("irondome-events")
            } else if evaluator_join.is_finished() {
                Some("irondome-evaluator")
            } else if poller.as_ref().is_some_and(JoinHandle::is_finished) {
                Some("irondome-memory")
            } else {
                None
            };
            if let Some(name) = dead {
                self.logger.send(ActivityEvent::Error {
                    code: "IRD-3900".to_string(),
                    message: format!("worker thread {name} exited unexpectedly"),
                });
                self.shutdown.trigger("worker exited");
            }
        }

        // 5. Teardown.
        let logger = self.logger.clone();
        let aggregator = Arc::clone(&self.aggregator);
        let teardown = ShutdownCoordinator::new().execute(vec![
            (
                "stop event source",
                Box::new(|_| {
                    source.stop();
                    true
                }),
            ),
            ("join event pump", Box::new(|deadline| join_until(pump, deadline))),
            (
                "drain event pipeline",
                Box::new(|_| {
                    pipeline.drain(&rx);
                    true
                }),
            ),
            (
                "join evaluator",
                Box::new(|deadline| join_until(evaluator_join, deadline)),
            ),
            (
                "join memory poller",
                Box::new(|deadline| poller.is_none_or(|handle| join_until(handle, deadline))),
            ),
            (
                "final evaluation",
                Box::new(|_| {
                    evaluator.tick(&aggregator, &logger);
                    true
                }),
            ),
        ]);

        for step in teardown.steps.iter().filter(|step| !step.ok) {
            self.logger.send(ActivityEvent::Error {
                code: "IRD-3900".to_string(),
                message: format!("shutdown step '{}' did not complete", step.name),
            });
        }
        for name in &teardown.abandoned {
            self.logger.send(ActivityEvent::Error {
                code: "IRD-3900".to_string(),
                message: format!("shutdown step '{name}' abandoned after timeout"),
            });
        }

        let summary = DaemonSummary {
            reason: self
                .shutdown
                .reason()
                .unwrap_or_else(|| "shutdown".to_string()),
            uptime_secs: start_time.elapsed().as_secs(),
            totals: self.aggregator.totals(),
            alerts: evaluator.alerts_emitted(),
            memory_breached: guard.has_breached(),
            teardown,
        };
        self.logger.send(ActivityEvent::DaemonStopped {
            reason: summary.reason.clone(),
            uptime_secs: summary.uptime_secs,
            events_seen: summary.totals.events_seen,
            reads_counted: summary.totals.reads_counted,
            alerts: summary.alerts,
        });
        self.logger
            .flush(self.config.memory.breach_flush_timeout().max(SUPERVISOR_INTERVAL));
        Ok(summary)
    }

    #[allow(clippy::type_complexity)]
    fn spawn_workers(
        &self,
        pipeline: &Arc<Pipeline>,
        rx: &Receiver<SourceMessage>,
        guard: &Arc<MemoryGuard>,
        evaluator: &Arc<ThresholdEvaluator>,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>, Option<JoinHandle<()>>)> {
        let pump = {
            let pipeline = Arc::clone(pipeline);
            let rx = rx.clone();
            let guard = Arc::clone(guard);
            let shutdown = self.shutdown.clone();
            spawn_worker("irondome-events", move || {
                pipeline.pump(&rx, &guard, &shutdown);
            })?
        };

        let evaluator_join = {
            let evaluator = Arc::clone(evaluator);
            let aggregator = Arc::clone(&self.aggregator);
            let shutdown = self.shutdown.clone();
            let logger = self.logger.clone();
            let ticks = tick(self.config.monitor.window());
            spawn_worker("irondome-evaluator", move || {
                evaluator.run(&aggregator, &ticks, &shutdown, &logger);
            })?
        };

        let poller = match guard.poll_interval() {
            Some(interval) if guard.mode() == MemoryGuardMode::SoftPoll => {
                guard.spawn_poller(tick(interval))?
            }
            _ => None,
        };

        Ok((pump, evaluator_join, poller))
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(body)
        .map_err(|e| IronDomeError::Runtime {
            details: format!("failed to spawn {name} thread: {e}"),
        })
}

// ──────────────────── tests ────────────────────
