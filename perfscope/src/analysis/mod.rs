//! Statistics over profiler histories
//!
//! This module contains the pure statistics computation and the background
//! engine that publishes its results, separated from the measurement path.

pub mod log_stats;
pub mod stats_engine;

pub use log_stats::{compute, LogStatsSnapshot};
pub use stats_engine::{StatsEngine, StatsStatus};
