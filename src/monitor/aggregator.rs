//! Per-root read counters for the current window.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::paths::WatchSet;
use crate::monitor::events::{FsEvent, FsEventKind};
use crate::platform::pal::Platform;

/// Who owns the file a read was observed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Named(String),
    /// The uid has no passwd entry.
    Uid(u32),
    /// Lookup failed (usually the file is already gone).
    Unknown { reason: String },
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Uid(uid) => write!(f, "uid:{uid}"),
            Self::Unknown { .. } => f.write_str("unknown"),
        }
    }
}

/// What `record` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Not an open.
    Ignored,
    /// An open outside every watched root.
    Unattributed,
    Counted { root: usize, owner: Owner },
}

/// Lifetime totals since the aggregator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorTotals {
    pub events_seen: u64,
    pub reads_counted: u64,
    pub unattributed: u64,
    pub owner_failures: u64,
}

/// Counts opens per watched root between evaluator ticks.
///
/// `record` and `snapshot_and_reset` may be called from different threads;
/// each increment lands in exactly one snapshot.
pub struct ReadRateAggregator {
    watch: WatchSet,
    platform: Arc<dyn Platform>,
    counters: Mutex<Vec<u64>>,
    events_seen: AtomicU64,
    reads_counted: AtomicU64,
    unattributed: AtomicU64,
    owner_failures: AtomicU64,
}

impl ReadRateAggregator {
    pub fn new(watch: WatchSet, platform: Arc<dyn Platform>) -> Self {
        let counters = vec![0; watch.len()];
        Self {
            watch,
            platform,
            counters: Mutex::new(counters),
            events_seen: AtomicU64::new(0),
            reads_counted: AtomicU64::new(0),
            unattributed: AtomicU64::new(0),
            owner_failures: AtomicU64::new(0),
        }
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch
    }

    /// Count `event` against its most specific root if it is an open.
    pub fn record(&self, event: &FsEvent) -> RecordOutcome {
        self.events_seen.fetch_add(1, Ordering::Relaxed);

        match event.kind {
            FsEventKind::Opened => {}
            FsEventKind::Modified
            | FsEventKind::Created
            | FsEventKind::Deleted
            | FsEventKind::Other => return RecordOutcome::Ignored,
        }

        let Some((root, _)) = self.watch.attribute(&event.path) else {
            self.unattributed.fetch_add(1, Ordering::Relaxed);
            return RecordOutcome::Unattributed;
        };

        // Outside the counter lock: stat + passwd lookup can block.
        let owner = match self.platform.file_owner(&event.path) {
            Ok(found) => found.name.map_or(Owner::Uid(found.uid), Owner::Named),
            Err(err) => {
                self.owner_failures.fetch_add(1, Ordering::Relaxed);
                Owner::Unknown {
                    reason: err.to_string(),
                }
            }
        };

        if let Some(count) = self.counters.lock().get_mut(root) {
            *count += 1;
        }
        self.reads_counted.fetch_add(1, Ordering::Relaxed);
        RecordOutcome::Counted { root, owner }
    }

    /// Take the counts accumulated since the previous call and start a new
    /// window at zero. Every watched root is present in the result.
    pub fn snapshot_and_reset(&self) -> BTreeMap<PathBuf, u64> {
        let fresh = vec![0; self.watch.len()];
        let taken = mem::replace(&mut *self.counters.lock(), fresh);
        self.watch
            .iter()
            .zip(taken)
            .map(|(root, count)| (root.path.clone(), count))
            .collect()
    }

    pub fn totals(&self) -> AggregatorTotals {
        AggregatorTotals {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            reads_counted: self.reads_counted.load(Ordering::Relaxed),
            unattributed: self.unattributed.load(Ordering::Relaxed),
            owner_failures: self.owner_failures.load(Ordering::Relaxed),
        }
    }
}
