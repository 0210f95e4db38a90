//! Fixed-window threshold check over the aggregator's counters.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};

use crate::daemon::signals::ShutdownSignal;
use crate::logger::dual::{ActivityEvent, LoggerHandle};
use crate::monitor::aggregator::ReadRateAggregator;

/// A root whose read count went over the limit in one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub path: PathBuf,
    pub observed: u64,
    pub limit: u64,
    pub window: Duration,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Possible disk read abuse detected at {} with {} reads in the last {} second(s).",
            self.path.display(),
            self.observed,
            self.window.as_secs_f64()
        )
    }
}

/// Where alerts go.
pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

impl AlertSink for LoggerHandle {
    fn emit(&self, alert: Alert) {
        self.send(ActivityEvent::ReadAbuse(alert));
    }
}

impl AlertSink for Sender<Alert> {
    fn emit(&self, alert: Alert) {
        let _ = self.send(alert);
    }
}

/// Compares each window's counts against the read limit.
pub struct ThresholdEvaluator {
    limit: u64,
    window: Duration,
    alerts_emitted: AtomicU64,
    drops: Option<(Arc<AtomicU64>, LoggerHandle)>,
}

impl ThresholdEvaluator {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            alerts_emitted: AtomicU64::new(0),
            drops: None,
        }
    }

    /// Warn once per tick about events the source had to drop.
    #[must_use]
    pub fn with_drop_reporting(mut self, dropped: Arc<AtomicU64>, logger: LoggerHandle) -> Self {
        self.drops = Some((dropped, logger));
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::Relaxed)
    }

    /// Alerts for every root strictly over the limit.
    pub fn evaluate(&self, snapshot: &BTreeMap<PathBuf, u64>) -> Vec<Alert> {
        snapshot
            .iter()
            .filter(|&(_, &count)| count > self.limit)
            .map(|(path, &count)| Alert {
                path: path.clone(),
                observed: count,
                limit: self.limit,
                window: self.window,
            })
            .collect()
    }

    /// Close the current window: snapshot, reset, emit. Returns alerts emitted.
    pub fn tick(&self, aggregator: &ReadRateAggregator, sink: &dyn AlertSink) -> usize {
        if let Some((dropped, logger)) = &self.drops {
            let count = dropped.swap(0, Ordering::Relaxed);
            if count > 0 {
                logger.send(ActivityEvent::EventsDropped { count });
            }
        }

        let snapshot = aggregator.snapshot_and_reset();
        let alerts = self.evaluate(&snapshot);
        let emitted = alerts.len();
        for alert in alerts {
            sink.emit(alert);
        }
        self.alerts_emitted
            .fetch_add(emitted as u64, Ordering::Relaxed);
        emitted
    }

    /// Evaluate on every tick until shutdown or the tick source closes.
    ///
    /// A tick already being evaluated when shutdown arrives finishes first.
    pub fn run(
        &self,
        aggregator: &ReadRateAggregator,
        ticks: &Receiver<Instant>,
        shutdown: &ShutdownSignal,
        sink: &dyn AlertSink,
    ) {
        let stop = shutdown.listener();
        while !shutdown.is_set() {
            select! {
                recv(ticks) -> tick => {
                    if tick.is_err() {
                        break;
                    }
                    self.tick(aggregator, sink);
                }
                recv(stop) -> _ => break,
            }
        }
    }
}
