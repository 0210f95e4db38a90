#![forbid(unsafe_code)]

//! IronDome (irondome): host abuse-detection daemon.
//!
//! Two mechanisms share one process:
//! 1. **Read-rate monitor**: watches paths for opens, attributes each one to
//!    the most specific watched root and the file owner, and warns when a
//!    root sees more reads in one window than the configured limit
//! 2. **Memory guard**: keeps the daemon itself inside a memory ceiling,
//!    either by polling RSS or by installing an address-space cap
//!
//! The daemon only detects and logs. It never blocks or kills readers.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use irondome::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use irondome::core::config::Config;
//! use irondome::monitor::aggregator::ReadRateAggregator;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod platform;
