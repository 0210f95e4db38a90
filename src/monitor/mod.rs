//! Read-rate monitoring: filesystem event source, per-root read counters,
//! fixed-window threshold evaluation.

pub mod aggregator;
pub mod evaluator;
pub mod events;
