//! Shutdown plumbing: the process-wide shutdown broadcast, SIGTERM/SIGINT
//! handling, and the ordered teardown sequence.
//!
//! Signals are consumed on a dedicated `signal-hook` iterator thread, so the
//! logging and broadcast work never runs in signal context.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;

// ──────────────────── shutdown signal ────────────────────

struct SignalState {
    flag: AtomicBool,
    broadcast: Mutex<Option<Sender<()>>>,
    listener: Receiver<()>,
    reason: Mutex<Option<String>>,
}

/// Set-once, broadcast cancellation shared by every component.
///
/// `is_set` is a single atomic load. Blocking observers wait on a channel
/// whose only sender is dropped by `trigger`, which wakes all of them at once.
#[derive(Clone)]
pub struct ShutdownSignal {
    state: Arc<SignalState>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            state: Arc::new(SignalState {
                flag: AtomicBool::new(false),
                broadcast: Mutex::new(Some(tx)),
                listener: rx,
                reason: Mutex::new(None),
            }),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    /// Request shutdown. Returns `false` if it was already requested; the
    /// first reason wins.
    pub fn trigger(&self, reason: &str) -> bool {
        if self.state.flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.state.reason.lock() = Some(reason.to_string());
        drop(self.state.broadcast.lock().take());
        true
    }

    /// Why shutdown was requested, once it has been.
    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().clone()
    }

    /// Receiver that disconnects when shutdown is triggered, for `select!`.
    pub fn listener(&self) -> Receiver<()> {
        self.state.listener.clone()
    }

    /// Block until shutdown or `timeout`. Returns whether shutdown is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        match self.state.listener.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Ok(()) | Err(RecvTimeoutError::Timeout) => self.is_set(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── signal handler ────────────────────

/// SIGTERM/SIGINT → log + shutdown broadcast, on a dedicated thread.
#[cfg(feature = "daemon")]
pub struct SignalHandler {
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

#[cfg(feature = "daemon")]
impl SignalHandler {
    /// Register the signal hooks and start the iterator thread.
    pub fn install(
        shutdown: ShutdownSignal,
        logger: crate::logger::dual::LoggerHandle,
    ) -> crate::core::errors::Result<Self> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        use crate::core::errors::IronDomeError;
        use crate::logger::dual::ActivityEvent;

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| IronDomeError::Runtime {
            details: format!("failed to register signal handlers: {e}"),
        })?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("irondome-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let name = signal_name(signal);
                    logger.send(ActivityEvent::ShutdownRequested {
                        source: name.to_string(),
                    });
                    shutdown.trigger(name);
                }
            })
            .map_err(|e| IronDomeError::Runtime {
                details: format!("failed to spawn signal thread: {e}"),
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Unregister and join the iterator thread.
    pub fn close(mut self) -> bool {
        self.handle.close();
        self.thread.take().is_none_or(|thread| thread.join().is_ok())
    }
}

#[cfg(feature = "daemon")]
impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[cfg(feature = "daemon")]
fn signal_name(signal: i32) -> &'static str {
    match signal {
        signal_hook::consts::SIGINT => "SIGINT",
        signal_hook::consts::SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

// ──────────────────── shutdown coordinator ────────────────────

/// One teardown step's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub ok: bool,
    pub elapsed: Duration,
}

/// What the teardown sequence did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub steps: Vec<StepOutcome>,
    /// Steps never started because the overall timeout ran out.
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn all_ok(&self) -> bool {
        self.abandoned.is_empty() && self.steps.iter().all(|step| step.ok)
    }
}

/// A named teardown action. Returns `true` if it completed cleanly.
pub type ShutdownStep<'a> = (&'a str, Box<dyn FnOnce(Instant) -> bool + 'a>);

/// Runs teardown steps in order under one overall deadline.
pub struct ShutdownCoordinator {
    /// Maximum time for the whole sequence.
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with the default 10-second timeout.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    /// Execute the steps in order. Each receives the overall deadline; a step
    /// that would start after the deadline is abandoned.
    pub fn execute(&self, steps: Vec<ShutdownStep<'_>>) -> ShutdownReport {
        let deadline = Instant::now() + self.timeout;
        let mut report = ShutdownReport::default();

        for (name, step) in steps {
            if Instant::now() >= deadline {
                report.abandoned.push(name.to_string());
                continue;
            }
            let started = Instant::now();
            let ok = step(deadline);
            report.steps.push(StepOutcome {
                name: name.to_string(),
                ok,
                elapsed: started.elapsed(),
            });
        }

        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Join `handle` unless it is still running at `deadline`, in which case it
/// is left detached. Returns `true` if the thread finished without panicking.
pub fn join_until<T>(handle: JoinHandle<T>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().is_ok()
}

// ──────────────────── tests ────────────────────
