//! Core types: errors, configuration, watched paths.

pub mod config;
pub mod errors;
pub mod paths;
