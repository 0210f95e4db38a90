//! Self-protection against unbounded memory growth.
//!
//! Two strategies share the [`MemoryLimiter`] seam:
//! - soft poll: sample RSS on a tick, exit(1) on breach after flushing logs;
//! - hard cap: install `RLIMIT_AS` before monitoring starts, so guarded
//!   allocations (`MemoryGuard::reserve`) fail recoverably and turn into a
//!   graceful shutdown.
//!
//! In hard-cap mode only `try_reserve` paths are recoverable. Any other
//! allocation that hits the cap aborts the process, since Rust's global
//! allocator has no fallible mode.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};

use crate::core::config::{MemoryConfig, MemoryGuardMode};
use crate::core::errors::{IronDomeError, Result};
use crate::daemon::signals::ShutdownSignal;
use crate::logger::dual::{ActivityEvent, LoggerHandle};
use crate::platform::pal::{AddressSpaceLimit, Platform};

const MIB: u64 = 1024 * 1024;

/// Process exit hook. Production uses `std::process::exit`.
pub type Terminator = Arc<dyn Fn(i32) + Send + Sync>;

// ──────────────────── limiter seam ────────────────────

/// One memory reading against the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatus {
    pub usage_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryStatus {
    pub fn breached(&self) -> bool {
        self.usage_bytes > self.limit_bytes
    }

    pub fn usage_mb(&self) -> f64 {
        self.usage_bytes as f64 / MIB as f64
    }
}

/// A memory enforcement strategy.
pub trait MemoryLimiter: Send + Sync {
    fn mode(&self) -> MemoryGuardMode;
    fn limit_mb(&self) -> u64;
    /// Prepare enforcement before monitoring starts. Errors are fatal.
    /// Returns the kernel limits in force when the strategy installs one.
    fn arm(&self) -> Result<Option<AddressSpaceLimit>>;
    fn sample(&self) -> Result<MemoryStatus>;
    /// Sampling period, for strategies that poll.
    fn poll_interval(&self) -> Option<Duration>;

    fn limit_bytes(&self) -> u64 {
        self.limit_mb().saturating_mul(MIB)
    }
}

/// Polls resident set size.
pub struct SoftPollLimiter {
    platform: Arc<dyn Platform>,
    limit_mb: u64,
    interval: Duration,
}

impl SoftPollLimiter {
    pub fn new(platform: Arc<dyn Platform>, limit_mb: u64, interval: Duration) -> Self {
        Self {
            platform,
            limit_mb,
            interval,
        }
    }
}

impl MemoryLimiter for SoftPollLimiter {
    fn mode(&self) -> MemoryGuardMode {
        MemoryGuardMode::SoftPoll
    }

    fn limit_mb(&self) -> u64 {
        self.limit_mb
    }

    fn arm(&self) -> Result<Option<AddressSpaceLimit>> {
        self.sample().map(|_| None).map_err(as_stats_error)
    }

    fn sample(&self) -> Result<MemoryStatus> {
        let memory = self.platform.process_memory()?;
        Ok(MemoryStatus {
            usage_bytes: memory.rss_bytes,
            limit_bytes: self.limit_bytes(),
        })
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }
}

/// Kernel-enforced address-space ceiling.
pub struct HardCapLimiter {
    platform: Arc<dyn Platform>,
    limit_mb: u64,
}

impl HardCapLimiter {
    pub fn new(platform: Arc<dyn Platform>, limit_mb: u64) -> Self {
        Self { platform, limit_mb }
    }
}

impl MemoryLimiter for HardCapLimiter {
    fn mode(&self) -> MemoryGuardMode {
        MemoryGuardMode::HardCap
    }

    fn limit_mb(&self) -> u64 {
        self.limit_mb
    }

    fn arm(&self) -> Result<Option<AddressSpaceLimit>> {
        let memory = self.platform.process_memory().map_err(as_stats_error)?;
        let cap = self.limit_bytes();
        if memory.vm_size_bytes >= cap {
            return Err(IronDomeError::MemoryCap {
                details: format!(
                    "address space is already {:.1} MB, at or above the {} MB cap",
                    memory.vm_size_bytes as f64 / MIB as f64,
                    self.limit_mb
                ),
            });
        }
        self.platform.set_address_space_limit(Some(cap)).map(Some)
    }

    fn sample(&self) -> Result<MemoryStatus> {
        let memory = self.platform.process_memory()?;
        Ok(MemoryStatus {
            usage_bytes: memory.vm_size_bytes,
            limit_bytes: self.limit_bytes(),
        })
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }
}

fn as_stats_error(err: IronDomeError) -> IronDomeError {
    match err {
        IronDomeError::MemoryStats { .. } => err,
        other => IronDomeError::MemoryStats {
            details: other.to_string(),
        },
    }
}

/// Build the limiter the configuration asks for.
pub fn limiter_for(config: &MemoryConfig, platform: Arc<dyn Platform>) -> Box<dyn MemoryLimiter> {
    match config.mode {
        MemoryGuardMode::SoftPoll => Box::new(SoftPollLimiter::new(
            platform,
            config.limit_mb,
            config.poll_interval(),
        )),
        MemoryGuardMode::HardCap => Box::new(HardCapLimiter::new(platform, config.limit_mb)),
    }
}

// ──────────────────── guard ────────────────────

/// Turns a memory breach into a controlled stop.
pub struct MemoryGuard {
    limiter: Box<dyn MemoryLimiter>,
    shutdown: ShutdownSignal,
    logger: LoggerHandle,
    terminator: Terminator,
    flush_timeout: Duration,
    breached: AtomicBool,
}

impl MemoryGuard {
    pub fn new(
        limiter: Box<dyn MemoryLimiter>,
        shutdown: ShutdownSignal,
        logger: LoggerHandle,
    ) -> Self {
        Self {
            limiter,
            shutdown,
            logger,
            terminator: Arc::new(|code| std::process::exit(code)),
            flush_timeout: Duration::from_millis(500),
            breached: AtomicBool::new(false),
        }
    }

    /// Replace the process exit hook.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    #[must_use]
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn mode(&self) -> MemoryGuardMode {
        self.limiter.mode()
    }

    pub fn limit_mb(&self) -> u64 {
        self.limiter.limit_mb()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.limiter.poll_interval()
    }

    pub fn has_breached(&self) -> bool {
        self.breached.load(Ordering::Acquire)
    }

    /// Install enforcement. Must run before monitoring begins.
    pub fn arm(&self) -> Result<()> {
        if let Some(limit) = self.limiter.arm()? {
            self.logger.send(ActivityEvent::MemoryCapInstalled {
                requested_mb: self.limiter.limit_mb(),
                limit,
            });
        }
        Ok(())
    }

    /// Take one reading and act on a breach.
    pub fn check(&self) -> Result<MemoryStatus> {
        let status = self.limiter.sample()?;
        self.logger.send(ActivityEvent::MemoryUsage {
            rss_bytes: status.usage_bytes,
        });
        if status.breached() {
            self.on_breach(status.usage_bytes);
        }
        Ok(status)
    }

    /// Grow `buffer` by `additional` slots without aborting on failure.
    ///
    /// A failed reservation is treated as a memory breach: it is logged,
    /// shutdown is requested, and `OutOfMemory` is returned so the caller
    /// can unwind.
    pub fn reserve<T>(
        &self,
        buffer: &mut Vec<T>,
        additional: usize,
        context: &'static str,
    ) -> Result<()> {
        buffer.try_reserve(additional).map_err(|err| {
            if !self.breached.swap(true, Ordering::AcqRel) {
                self.logger.send(ActivityEvent::MemoryBreach {
                    usage_bytes: self.limiter.sample().map_or(0, |s| s.usage_bytes),
                    limit_mb: self.limiter.limit_mb(),
                    mode: self.limiter.mode().to_string(),
                });
            }
            self.shutdown.trigger("memory limit exceeded");
            IronDomeError::OutOfMemory {
                context,
                details: err.to_string(),
            }
        })
    }

    fn on_breach(&self, usage_bytes: u64) {
        if self.breached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.logger.send(ActivityEvent::MemoryBreach {
            usage_bytes,
            limit_mb: self.limiter.limit_mb(),
            mode: self.limiter.mode().to_string(),
        });
        match self.limiter.mode() {
            MemoryGuardMode::SoftPoll => {
                self.logger.flush(self.flush_timeout);
                (self.terminator)(1);
            }
            MemoryGuardMode::HardCap => {
                self.shutdown.trigger("memory limit exceeded");
            }
        }
    }

    /// Start the `irondome-memory` sampling thread, if this strategy polls.
    ///
    /// The thread stops on shutdown, when `ticks` closes, or after a breach.
    pub fn spawn_poller(self: &Arc<Self>, ticks: Receiver<Instant>) -> Result<Option<JoinHandle<()>>> {
        if self.limiter.poll_interval().is_none() {
            return Ok(None);
        }
        let guard = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("irondome-memory".to_string())
            .spawn(move || guard.poll_loop(&ticks))
            .map_err(|e| IronDomeError::Runtime {
                details: format!("failed to spawn memory poller thread: {e}"),
            })?;
        Ok(Some(handle))
    }

    fn poll_loop(&self, ticks: &Receiver<Instant>) {
        let stop = self.shutdown.listener();
        let mut last_error: Option<String> = None;
        while !self.shutdown.is_set() && !self.has_breached() {
            select! {
                recv(ticks) -> tick => {
                    if tick.is_err() {
                        break;
                    }
                    match self.check() {
                        Ok(_) => last_error = None,
                        Err(err) => {
                            let message = err.to_string();
                            if last_error.as_deref() != Some(message.as_str()) {
                                self.logger.send(ActivityEvent::Error {
                                    code: err.code().to_string(),
                                    message: message.clone(),
                                });
                            }
                            last_error = Some(message);
                        }
                    }
                }
                recv(stop) -> _ => break,
            }
        }
    }
}

// ──────────────────── tests ────────────────────
