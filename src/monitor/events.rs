//! Filesystem event source backed by inotify.
//!
//! Every watched directory is registered with `IN_OPEN` alongside the
//! create/modify/delete family, so opens of files beneath a root arrive as
//! [`FsEventKind::Opened`]. Directory roots are watched recursively: the tree
//! is walked at registration and new subdirectories are picked up from their
//! `IN_CREATE`/`IN_MOVED_TO` events.
//!
//! A reader thread (`irondome-inotify`) drains the non-blocking inotify
//! descriptor and pushes into a bounded crossbeam channel with `try_send`; a
//! full channel drops the event and bumps a counter instead of stalling the
//! kernel queue. Delivery is gated by an `RwLock<bool>` so that once
//! [`EventSource::stop`] returns nothing else reaches the channel.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded, select};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use parking_lot::{Mutex, RwLock};

use crate::core::errors::{IronDomeError, Result};
use crate::core::paths::{PathKind, WatchSet, WatchedPath};
use crate::logger::dual::{ActivityEvent, LoggerHandle};

/// Idle wait between drains of an empty inotify queue.
const READ_INTERVAL: Duration = Duration::from_millis(10);
/// Room for dozens of events, and always for one with a maximal name.
const READ_BUFFER_BYTES: usize = 8 * 1024;

// ──────────────────── event model ────────────────────

/// Closed set of event kinds the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Opened,
    Modified,
    Created,
    Deleted,
    Other,
}

impl FsEventKind {
    /// Map an inotify event mask onto the closed set.
    ///
    /// Only a file open is `Opened`. Per-`read()` access notifications and
    /// directory opens (listings) are `Other`.
    pub fn from_mask(mask: EventMask) -> Self {
        if mask.contains(EventMask::OPEN) {
            if mask.contains(EventMask::ISDIR) {
                Self::Other
            } else {
                Self::Opened
            }
        } else if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            Self::Created
        } else if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE) {
            Self::Modified
        } else if mask.intersects(
            EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM | EventMask::MOVE_SELF,
        ) {
            Self::Deleted
        } else {
            Self::Other
        }
    }
}

/// One filesystem event for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
    pub observed_at: SystemTime,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: FsEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
            observed_at: SystemTime::now(),
        }
    }
}

/// What the source pushes into the pipeline channel.
#[derive(Debug, Clone)]
pub enum SourceMessage {
    Event(FsEvent),
    /// The OS reported a failure for an established watch.
    WatchError { paths: Vec<PathBuf>, details: String },
}

// ──────────────────── subscription planning ────────────────────

/// One watch registration: a directory, optionally with its whole tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub dir: PathBuf,
    pub recursive: bool,
}

impl Subscription {
    fn covered_by(&self, other: &Self) -> bool {
        other.recursive && self.dir != other.dir && self.dir.starts_with(&other.dir)
    }
}

/// Turn watched roots into the minimal set of watch registrations.
///
/// Directory roots watch recursively; file roots watch their parent
/// directory without recursion. Registrations on the same directory merge
/// (recursive wins), and any registration beneath a recursive one is dropped
/// so the kernel never delivers the same event twice.
pub fn plan_subscriptions<'a, I>(roots: I) -> Vec<Subscription>
where
    I: IntoIterator<Item = &'a WatchedPath>,
{
    let mut merged: Vec<Subscription> = Vec::new();
    for root in roots {
        let wanted = match root.kind {
            PathKind::Directory => Subscription {
                dir: root.path.clone(),
                recursive: true,
            },
            PathKind::File => Subscription {
                dir: root
                    .path
                    .parent()
                    .map_or_else(|| root.path.clone(), Path::to_path_buf),
                recursive: false,
            },
        };
        match merged.iter_mut().find(|sub| sub.dir == wanted.dir) {
            Some(existing) => existing.recursive |= wanted.recursive,
            None => merged.push(wanted),
        }
    }

    let snapshot = merged.clone();
    merged.retain(|sub| !snapshot.iter().any(|other| sub.covered_by(other)));
    merged
}

fn watch_mask() -> WatchMask {
    WatchMask::OPEN
        | WatchMask::CREATE
        | WatchMask::MODIFY
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
}

// ──────────────────── kernel watches ────────────────────

/// One kernel watch: the directory it covers and the subscription it serves.
#[derive(Debug, Clone)]
struct WatchEntry {
    dir: PathBuf,
    subscription: PathBuf,
    recursive: bool,
}

/// Result of one drain of the inotify queue.
#[derive(Debug, Default)]
struct Drained {
    messages: Vec<SourceMessage>,
    overflows: u64,
    raw_events: usize,
}

struct Watches {
    inotify: Option<Inotify>,
    roots: Vec<WatchedPath>,
    active: Vec<Subscription>,
    entries: HashMap<WatchDescriptor, WatchEntry>,
}

impl Watches {
    fn add_watch(&mut self, dir: &Path, subscription: &Path, recursive: bool) -> std::io::Result<()> {
        let Some(inotify) = self.inotify.as_mut() else {
            return Err(std::io::Error::other("event source stopped"));
        };
        let wd = inotify.add_watch(dir, watch_mask())?;
        self.entries.insert(wd, WatchEntry {
            dir: dir.to_path_buf(),
            subscription: subscription.to_path_buf(),
            recursive,
        });
        Ok(())
    }

    /// Watch `top` and every directory beneath it. Symlinks are not followed.
    ///
    /// Only a failure on `top` itself is reported; unreadable subdirectories
    /// are left unwatched.
    fn add_tree(&mut self, top: &Path, subscription: &Path) -> std::io::Result<()> {
        self.add_watch(top, subscription, true)?;
        let mut pending = vec![top.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(listing) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in listing.flatten() {
                if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                    let child = entry.path();
                    if self.add_watch(&child, subscription, true).is_ok() {
                        pending.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    fn register(&mut self, sub: &Subscription) -> std::io::Result<()> {
        if sub.recursive {
            self.add_tree(&sub.dir, &sub.dir)
        } else {
            self.add_watch(&sub.dir, &sub.dir, false)
        }
    }

    /// Remove every kernel watch serving `subscription`.
    fn unregister(&mut self, subscription: &Path) {
        let stale: Vec<WatchDescriptor> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.subscription == subscription)
            .map(|(wd, _)| wd.clone())
            .collect();
        for wd in stale {
            self.entries.remove(&wd);
            if let Some(inotify) = self.inotify.as_mut() {
                // The kernel already removed watches on deleted directories.
                let _ = inotify.rm_watch(wd);
            }
        }
    }

    /// Roots whose events arrive through `subscription`.
    fn roots_served_by(&self, subscription: &Path, recursive: bool) -> Vec<PathBuf> {
        self.roots
            .iter()
            .filter(|root| {
                if recursive {
                    root.path.starts_with(subscription)
                } else {
                    root.path.parent() == Some(subscription)
                }
            })
            .map(|root| root.path.clone())
            .collect()
    }

    /// Read whatever the kernel has queued, without blocking.
    fn drain(&mut self, buffer: &mut [u8]) -> std::io::Result<Drained> {
        let Some(inotify) = self.inotify.as_mut() else {
            return Ok(Drained::default());
        };
        let raw: Vec<(WatchDescriptor, EventMask, Option<OsString>)> = inotify
            .read_events(buffer)?
            .map(|event| (event.wd, event.mask, event.name.map(|name| name.to_os_string())))
            .collect();

        let mut drained = Drained {
            raw_events: raw.len(),
            ..Drained::default()
        };
        let observed_at = SystemTime::now();
        for (wd, mask, name) in raw {
            if mask.contains(EventMask::Q_OVERFLOW) {
                drained.overflows += 1;
                continue;
            }
            let Some(entry) = self.entries.get(&wd).cloned() else {
                continue;
            };
            if mask.contains(EventMask::IGNORED) {
                self.entries.remove(&wd);
                if entry.dir == entry.subscription {
                    drained.messages.push(SourceMessage::WatchError {
                        paths: self.roots_served_by(&entry.subscription, entry.recursive),
                        details: format!("watch on {} was removed by the kernel", entry.dir.display()),
                    });
                }
                continue;
            }

            let path = name.map_or_else(|| entry.dir.clone(), |name| entry.dir.join(name));
            if entry.recursive
                && mask.contains(EventMask::ISDIR)
                && mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
            {
                let _ = self.add_tree(&path, &entry.subscription);
            }
            drained.messages.push(SourceMessage::Event(FsEvent {
                path,
                kind: FsEventKind::from_mask(mask),
                observed_at,
            }));
        }
        Ok(drained)
    }
}

// ──────────────────── delivery ────────────────────

struct Shared {
    open: RwLock<bool>,
    tx: Sender<SourceMessage>,
    dropped: Arc<AtomicU64>,
}

impl Shared {
    fn deliver(&self, message: SourceMessage) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Push `messages` unless the source has been stopped.
    fn dispatch(&self, messages: Vec<SourceMessage>) {
        let open = self.open.read();
        if !*open {
            return;
        }
        for message in messages {
            self.deliver(message);
        }
    }
}

fn read_loop(shared: &Shared, watches: &Mutex<Watches>, stop: &Receiver<()>) {
    let mut buffer = vec![0_u8; READ_BUFFER_BYTES];
    let mut last_error: Option<String> = None;
    loop {
        if !matches!(stop.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }
        let drained = watches.lock().drain(&mut buffer);
        let busy = match drained {
            Ok(drained) => {
                last_error = None;
                if drained.overflows > 0 {
                    shared.dropped.fetch_add(drained.overflows, Ordering::Relaxed);
                }
                shared.dispatch(drained.messages);
                drained.raw_events > 0
            }
            Err(err) => {
                let details = format!("reading inotify events failed: {err}");
                if last_error.as_deref() != Some(details.as_str()) {
                    shared.dispatch(vec![SourceMessage::WatchError {
                        paths: Vec::new(),
                        details: details.clone(),
                    }]);
                }
                last_error = Some(details);
                false
            }
        };
        if !busy {
            select! {
                recv(stop) -> _ => return,
                default(READ_INTERVAL) => {}
            }
        }
    }
}

// ──────────────────── source ────────────────────

/// Live OS subscriptions for a watch set.
pub struct EventSource {
    shared: Arc<Shared>,
    watches: Arc<Mutex<Watches>>,
    reader: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    logger: LoggerHandle,
}

impl EventSource {
    /// Register watches for every root and return the event stream.
    ///
    /// Roots whose watch cannot be registered are skipped with a warning.
    /// Fails only when no registration succeeds.
    pub fn start(
        watch: &WatchSet,
        channel_capacity: usize,
        logger: LoggerHandle,
    ) -> Result<(Self, Receiver<SourceMessage>)> {
        let inotify = Inotify::init().map_err(|err| IronDomeError::Watch {
            path: PathBuf::from("/"),
            details: format!("cannot create inotify instance: {err}"),
        })?;

        let (tx, rx) = bounded(channel_capacity.max(1));
        let source = Self {
            shared: Arc::new(Shared {
                open: RwLock::new(true),
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            }),
            watches: Arc::new(Mutex::new(Watches {
                inotify: Some(inotify),
                roots: watch.iter().cloned().collect(),
                active: Vec::new(),
                entries: HashMap::new(),
            })),
            reader: Mutex::new(None),
            logger,
        };

        let plan = plan_subscriptions(watch);
        let established = source.establish(&plan);
        if established == 0 {
            source.stop();
            return Err(IronDomeError::NoWatchablePaths {
                details: format!("none of {} watch registrations succeeded", plan.len()),
            });
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shared = Arc::clone(&source.shared);
        let watches = Arc::clone(&source.watches);
        let join = thread::Builder::new()
            .name("irondome-inotify".to_string())
            .stack_size(256 * 1024)
            .spawn(move || read_loop(&shared, &watches, &stop_rx))
            .map_err(|e| IronDomeError::Runtime {
                details: format!("failed to spawn inotify reader thread: {e}"),
            })?;
        *source.reader.lock() = Some((stop_tx, join));
        Ok((source, rx))
    }

    /// Counter of events dropped because the pipeline channel or the kernel
    /// queue was full.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.dropped)
    }

    /// Registrations currently held.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.watches.lock().active.clone()
    }

    /// Number of kernel watches currently held, subdirectories included.
    pub fn watch_count(&self) -> usize {
        self.watches.lock().entries.len()
    }

    /// Stop watching `root` and re-plan the remaining registrations.
    ///
    /// Returns `false` if the root was not active.
    pub fn retire_root(&self, root: &Path) -> bool {
        let missing: Vec<Subscription> = {
            let mut watches = self.watches.lock();
            let before = watches.roots.len();
            watches.roots.retain(|r| r.path != root);
            if watches.roots.len() == before {
                return false;
            }
            let plan = plan_subscriptions(&watches.roots);

            let stale: Vec<Subscription> = watches
                .active
                .iter()
                .filter(|sub| !plan.contains(sub))
                .cloned()
                .collect();
            for sub in &stale {
                watches.unregister(&sub.dir);
            }
            watches.active.retain(|sub| plan.contains(sub));
            plan.into_iter()
                .filter(|sub| !watches.active.contains(sub))
                .collect()
        };
        self.establish(&missing);
        true
    }

    /// Whether events are still being delivered.
    pub fn is_running(&self) -> bool {
        *self.shared.open.read()
    }

    /// Close delivery, join the reader and release every watch. Idempotent.
    ///
    /// Blocks until any in-flight dispatch has finished delivering.
    pub fn stop(&self) {
        {
            let mut open = self.shared.open.write();
            if !*open {
                return;
            }
            *open = false;
        }
        if let Some((stop_tx, join)) = self.reader.lock().take() {
            drop(stop_tx);
            let _ = join.join();
        }
        let inotify = {
            let mut watches = self.watches.lock();
            watches.active.clear();
            watches.entries.clear();
            watches.inotify.take()
        };
        drop(inotify);
    }

    fn establish(&self, plan: &[Subscription]) -> usize {
        let mut watches = self.watches.lock();
        let mut established = 0;
        for sub in plan {
            match watches.register(sub) {
                Ok(()) => {
                    established += 1;
                    self.logger.send(ActivityEvent::WatchEstablished {
                        path: sub.dir.clone(),
                        recursive: sub.recursive,
                    });
                    watches.active.push(sub.clone());
                }
                Err(err) => self.logger.send(ActivityEvent::WatchSkipped {
                    path: sub.dir.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        established
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.stop();
    }
}
