//! Measurement core
//!
//! This module contains everything on the measured path and just behind it:
//! - Injectable clocks
//! - Fixed-capacity sample history
//! - Per-key profilers with nesting-aware start/stop
//! - The profiler registry and its ranked log snapshots
//! - The background sampler that refreshes those snapshots

pub mod clock;
pub mod history;
pub mod profiler;
pub mod registry;
pub mod sampler;

// Re-export common types
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use history::{History, Sample};
pub use profiler::{MeasureSite, MeasurementHandle, Profiler};
pub use registry::{ProfileLog, ProfileRegistry};
pub use sampler::Sampler;
