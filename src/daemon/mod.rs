//! Daemon subsystem: supervisor loop, memory guard, signal handling and
//! ordered shutdown.

pub mod loop_main;
pub mod memory_guard;
pub mod signals;
