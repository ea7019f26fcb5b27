//! Profiler registry and ranked log snapshots
//!
//! The registry maps measurement keys to [`Profiler`]s and, once per
//! sampling interval, turns their interval totals into a fresh ranked list
//! of [`ProfileLog`]s.
//!
//! ## Snapshot Semantics
//!
//! ```text
//!   refresh_logs():  build Vec<ProfileLog>  →  swap Arc under write lock
//!   current_logs():  clone Arc under read lock  →  immutable snapshot
//! ```
//!
//! A list is never mutated after publication; consumers hold an `Arc` to one
//! cycle's list and re-fetch by key to see the next.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use serde::Serialize;

use super::clock::Clock;
use super::profiler::{MeasureSite, MeasurementHandle, Profiler};
use crate::domain::PatchTarget;

/// One row of the ranked view, valid for a single refresh cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileLog {
    pub key: String,
    pub label: String,
    /// Time spent in the last interval, in milliseconds
    pub last_duration_ms: f64,
    /// Share of the interval's total across all keys, 0.0 to 1.0
    pub percent: f64,
    /// Calls in the last interval
    pub calls: u32,
    pub target: Option<PatchTarget>,
}

pub struct ProfileRegistry {
    collecting: AtomicBool,
    capacity: usize,
    clock: Arc<dyn Clock>,
    profilers: RwLock<HashMap<String, Arc<Profiler>>>,
    logs: RwLock<Arc<Vec<ProfileLog>>>,
    collisions: AtomicU64,
}

impl ProfileRegistry {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            collecting: AtomicBool::new(false),
            capacity,
            clock,
            profilers: RwLock::new(HashMap::new()),
            logs: RwLock::new(Arc::new(Vec::new())),
            collisions: AtomicU64::new(0),
        }
    }

    pub fn set_collecting(&self, on: bool) {
        self.collecting.store(on, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open a measurement on `key`, creating its profiler on first use.
    ///
    /// `label` runs only when the profiler is created. A key first seen from
    /// one method and later from another is a collision, reported once and
    /// merged into the same history.
    pub fn start<F>(&self, key: &str, label: F, site: Option<MeasureSite<'_>>) -> MeasurementHandle
    where
        F: FnOnce() -> String,
    {
        if !self.is_collecting() {
            return MeasurementHandle::inert();
        }
        let profiler = self.profiler_for(key, label, site);
        if let (Some(expected), Some(actual)) = (profiler.method(), site) {
            if expected != actual.method && profiler.mark_collision() {
                self.collisions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Measurement key {key} is shared by {} and {}; their samples are merged",
                    profiler.target().map_or_else(|| expected.to_string(), ToString::to_string),
                    actual.target
                );
            }
        }
        MeasurementHandle::started(profiler)
    }

    fn profiler_for<F>(&self, key: &str, label: F, site: Option<MeasureSite<'_>>) -> Arc<Profiler>
    where
        F: FnOnce() -> String,
    {
        if let Some(existing) = self.profilers.read().get(key) {
            return Arc::clone(existing);
        }
        let mut profilers = self.profilers.write();
        Arc::clone(profilers.entry(key.to_string()).or_insert_with(|| {
            debug!("Creating profiler for {key}");
            Arc::new(Profiler::new(key, label(), site, self.capacity, Arc::clone(&self.clock)))
        }))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Profiler>> {
        self.profilers.read().get(key).cloned()
    }

    /// Registered keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.profilers.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn profilers(&self) -> Vec<Arc<Profiler>> {
        let mut all: Vec<_> = self.profilers.read().values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(b.key()));
        all
    }

    /// Distinct keys that saw colliding call sites
    #[must_use]
    pub fn collision_count(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }

    /// Build and publish the next ranked list from every profiler's interval.
    pub fn refresh_logs(&self) -> Arc<Vec<ProfileLog>> {
        let profilers = self.profilers();
        let intervals: Vec<(Arc<Profiler>, f64, u32)> = profilers
            .into_iter()
            .map(|p| {
                let (ms, hits) = p.take_interval();
                (p, ms, hits)
            })
            .collect();

        let total: f64 = intervals.iter().map(|(_, ms, _)| ms).sum();
        let mut logs: Vec<ProfileLog> = intervals
            .into_iter()
            .map(|(p, ms, calls)| ProfileLog {
                key: p.key().to_string(),
                label: p.label().to_string(),
                last_duration_ms: ms,
                percent: if total > 0.0 { ms / total } else { 0.0 },
                calls,
                target: p.target().map(PatchTarget::from),
            })
            .collect();
        logs.sort_by(|a, b| b.last_duration_ms.total_cmp(&a.last_duration_ms).then_with(|| a.key.cmp(&b.key)));

        let logs = Arc::new(logs);
        *self.logs.write() = Arc::clone(&logs);
        logs
    }

    /// Last published list
    #[must_use]
    pub fn current_logs(&self) -> Arc<Vec<ProfileLog>> {
        Arc::clone(&self.logs.read())
    }

    /// Last published list restricted to labels containing `query`,
    /// ignoring case. An empty query matches everything.
    #[must_use]
    pub fn filtered_logs(&self, query: &str) -> Vec<ProfileLog> {
        let logs = self.current_logs();
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return logs.as_ref().clone();
        }
        logs.iter().filter(|log| log.label.to_lowercase().contains(&needle)).cloned().collect()
    }

    /// Drop every profiler and the published list.
    pub fn reset(&self) {
        let drained: Vec<Arc<Profiler>> = self.profilers.write().drain().map(|(_, p)| p).collect();
        for profiler in &drained {
            profiler.halt();
        }
        *self.logs.write() = Arc::new(Vec::new());
        debug!("Registry reset ({} profilers dropped)", drained.len());
    }

    /// Clear every history but keep the profilers.
    pub fn reset_histories(&self) {
        for profiler in self.profilers() {
            profiler.reset();
        }
    }
}

impl std::fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("collecting", &self.is_collecting())
            .field("profilers", &self.profilers.read().len())
            .finish_non_exhaustive()
    }
}
