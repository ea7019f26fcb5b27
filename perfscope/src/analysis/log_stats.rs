//! Deep statistics over one profiler's history.
//!
//! Where the registry shows a single interval per key, this module looks at
//! the full history and answers "how does this key usually behave, and when
//! did it spike?".
//!
//! # Outlier Cutoff
//!
//! ```text
//!   mean   = Σ dᵢ / n
//!   stddev = sqrt( Σ (dᵢ − mean)² / n )      (population)
//!   cutoff = mean + k · stddev               (k = 2 by default)
//!   spikes = { i | dᵢ > cutoff }
//! ```
//!
//! For the history `[1, 2, 2, 3, 100]` and `k = 2`: mean = 21.6,
//! stddev ≈ 39.2051, cutoff ≈ 100.0102. No sample exceeds the cutoff, so
//! there are no spikes: a single large outlier inflates the deviation enough
//! to hide itself in a five-sample window.
//!
//! # Performance
//!
//! - `compute()`: two passes over the history, O(n)
//! - Memory: O(spikes)

// Sample counts become f64 divisors
#![allow(clippy::cast_precision_loss)]

use serde::Serialize;

use crate::domain::StatsError;
use crate::profiling::Sample;

// =============================================================================
// SNAPSHOT (OUTPUT TYPE)
// =============================================================================

/// Aggregate statistics for one key, computed from its whole history.
///
/// Snapshots are immutable once built; the statistics engine publishes a
/// new `Arc<LogStatsSnapshot>` rather than updating one in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStatsSnapshot {
    pub key: String,

    /// Number of history entries the statistics cover.
    pub entries: usize,

    /// Σ hits over all entries.
    pub total_calls: u64,

    /// Σ durations, in milliseconds.
    pub total_time: f64,

    /// Longest single entry, in milliseconds.
    pub highest_time: f64,

    /// Most hits in a single entry.
    pub highest_calls: u32,

    /// `total_time / total_calls`, or 0 when nothing was called.
    pub mean_time_per_call: f64,

    /// `total_calls / entries`.
    pub mean_calls_per_frame: f64,

    /// `total_time / entries`; also the mean used for the cutoff.
    pub mean_time_per_frame: f64,

    /// `mean + k · stddev` over entry durations.
    pub outlier_cutoff: f64,

    /// Indices into the history (oldest = 0) of entries above the cutoff.
    pub spikes: Vec<usize>,
}

impl LogStatsSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

// =============================================================================
// COMPUTATION
// =============================================================================

/// Compute statistics for `key` from `samples` (oldest first).
///
/// # Errors
///
/// [`StatsError::NonFinite`] if any duration is NaN or infinite; such a
/// history would poison every derived value.
pub fn compute(key: &str, samples: &[Sample], sigma: f64) -> Result<LogStatsSnapshot, StatsError> {
    if let Some(index) = samples.iter().position(|s| !s.duration_ms.is_finite()) {
        return Err(StatsError::NonFinite { key: key.to_string(), index });
    }

    let entries = samples.len();
    let total_calls: u64 = samples.iter().map(|s| u64::from(s.hits)).sum();
    let total_time: f64 = samples.iter().map(|s| s.duration_ms).sum();
    let highest_time = samples.iter().map(|s| s.duration_ms).fold(0.0, f64::max);
    let highest_calls = samples.iter().map(|s| s.hits).max().unwrap_or(0);

    let mean = ratio(total_time, entries as f64);
    let variance = ratio(samples.iter().map(|s| (s.duration_ms - mean).powi(2)).sum(), entries as f64);
    let outlier_cutoff = mean + sigma * variance.sqrt();

    let spikes = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.duration_ms > outlier_cutoff)
        .map(|(i, _)| i)
        .collect();

    Ok(LogStatsSnapshot {
        key: key.to_string(),
        entries,
        total_calls,
        total_time,
        highest_time,
        highest_calls,
        mean_time_per_call: ratio(total_time, total_calls as f64),
        mean_calls_per_frame: ratio(total_calls as f64, entries as f64),
        mean_time_per_frame: mean,
        outlier_cutoff,
        spikes,
    })
}

/// Division that yields 0 for a zero denominator.
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(durations: &[f64]) -> Vec<Sample> {
        durations.iter().map(|&d| Sample { duration_ms: d, hits: 1 }).collect()
    }

    #[test]
    fn test_closed_form_cutoff() {
        let stats = compute("K", &samples(&[1.0, 2.0, 2.0, 3.0, 100.0]), 2.0).unwrap();

        let mean = 21.6_f64;
        let variance = [1.0_f64, 2.0, 2.0, 3.0, 100.0].iter().map(|d| (d - mean).powi(2)).sum::<f64>() / 5.0;
        let expected_cutoff = mean + 2.0 * variance.sqrt();

        assert!((stats.mean_time_per_frame - 21.6).abs() < 1e-9);
        assert!((stats.outlier_cutoff - expected_cutoff).abs() < 1e-9);
        assert!((stats.outlier_cutoff - 100.0102).abs() < 1e-3);
        assert!(stats.spikes.is_empty());
    }

    #[test]
    fn test_spike_flagged_above_cutoff() {
        let mut durations = vec![1.0; 9];
        durations.push(50.0);
        let stats = compute("K", &samples(&durations), 2.0).unwrap();

        // mean 5.9, stddev 14.7, cutoff 35.3
        assert!((stats.outlier_cutoff - 35.3).abs() < 1e-9);
        assert_eq!(stats.spikes, vec![9]);
    }

    #[test]
    fn test_totals_and_means() {
        let history = vec![
            Sample { duration_ms: 2.0, hits: 1 },
            Sample { duration_ms: 6.0, hits: 3 },
        ];
        let stats = compute("K", &history, 2.0).unwrap();

        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_calls, 4);
        assert!((stats.total_time - 8.0).abs() < 1e-9);
        assert!((stats.highest_time - 6.0).abs() < 1e-9);
        assert_eq!(stats.highest_calls, 3);
        assert!((stats.mean_time_per_call - 2.0).abs() < 1e-9);
        assert!((stats.mean_calls_per_frame - 2.0).abs() < 1e-9);
        assert!((stats.mean_time_per_frame - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_history_is_all_zero() {
        let stats = compute("K", &[], 2.0).unwrap();
        assert!(stats.is_empty());
        assert_eq!(stats.total_calls, 0);
        assert!(stats.mean_time_per_call.abs() < f64::EPSILON);
        assert!(stats.outlier_cutoff.abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let err = compute("K", &samples(&[1.0, f64::NAN]), 2.0).unwrap_err();
        assert!(matches!(err, StatsError::NonFinite { index: 1, .. }));
    }
}
