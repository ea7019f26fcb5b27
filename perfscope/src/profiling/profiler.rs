//! Per-key timing recorder
//!
//! ## Nesting
//!
//! ```text
//!   start ─┬─ start ── stop ─┬─ stop        depth 1 → 2 → 1 → 0
//!          └─────────────────┘
//!   committed sample: (outer elapsed, 2 hits)
//! ```
//!
//! A depth counter makes recursive and re-entrant calls on one key commit a
//! single sample covering the outermost interval, so overlapping intervals
//! are never counted twice. Every `start` inside that interval adds a hit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use perfscope_common::{MethodId, MethodRef};

use super::clock::Clock;
use super::history::{History, Sample};

/// Method a measurement is taken for.
///
/// Sites are told apart by `method`; `target` is only read when a profiler
/// is created.
#[derive(Debug, Clone, Copy)]
pub struct MeasureSite<'a> {
    pub method: MethodId,
    pub target: &'a MethodRef,
}

impl<'a> MeasureSite<'a> {
    pub fn new(method: MethodId, target: &'a MethodRef) -> Self {
        Self { method, target }
    }
}

#[derive(Debug)]
struct ProfilerState {
    depth: u32,
    started: Duration,
    pending_hits: u32,
    history: History,
    interval_ms: f64,
    interval_hits: u32,
    active: bool,
}

pub struct Profiler {
    key: String,
    label: String,
    site: Option<(MethodId, MethodRef)>,
    clock: Arc<dyn Clock>,
    state: Mutex<ProfilerState>,
    collision_reported: AtomicBool,
}

impl Profiler {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        site: Option<MeasureSite<'_>>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            site: site.map(|s| (s.method, s.target.clone())),
            clock,
            state: Mutex::new(ProfilerState {
                depth: 0,
                started: Duration::ZERO,
                pending_hits: 0,
                history: History::new(capacity),
                interval_ms: 0.0,
                interval_hits: 0,
                active: true,
            }),
            collision_reported: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> Option<&MethodRef> {
        self.site.as_ref().map(|(_, target)| target)
    }

    /// Method the profiler was created for
    pub fn method(&self) -> Option<MethodId> {
        self.site.as_ref().map(|(method, _)| *method)
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        state.depth += 1;
        if state.depth == 1 {
            state.started = self.clock.now();
            state.pending_hits = 0;
            state.active = true;
        }
        state.pending_hits = state.pending_hits.saturating_add(1);
    }

    /// Close one level; the outermost stop commits a sample.
    pub fn stop(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.depth == 0 {
            return;
        }
        state.depth -= 1;
        if state.depth > 0 {
            return;
        }

        let elapsed_ms = now.saturating_sub(state.started).as_secs_f64() * 1000.0;
        let hits = std::mem::take(&mut state.pending_hits);
        state.history.push(Sample { duration_ms: elapsed_ms, hits });
        state.interval_ms += elapsed_ms;
        state.interval_hits = state.interval_hits.saturating_add(hits);
    }

    /// Clear history and counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.depth = 0;
        state.pending_hits = 0;
        state.history.clear();
        state.interval_ms = 0.0;
        state.interval_hits = 0;
    }

    /// Abandon any open interval and mark the profiler inactive.
    pub fn halt(&self) {
        let mut state = self.state.lock();
        state.depth = 0;
        state.pending_hits = 0;
        state.active = false;
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    /// Copy of the history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Sample> {
        self.state.lock().history.to_vec()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    #[must_use]
    pub fn last_sample(&self) -> Option<Sample> {
        self.state.lock().history.last().copied()
    }

    /// Time and hits committed since the previous call.
    pub fn take_interval(&self) -> (f64, u32) {
        let mut state = self.state.lock();
        let taken = (state.interval_ms, state.interval_hits);
        state.interval_ms = 0.0;
        state.interval_hits = 0;
        taken
    }

    /// True the first time a colliding call site is reported.
    pub(crate) fn mark_collision(&self) -> bool {
        !self.collision_reported.swap(true, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler").field("key", &self.key).field("label", &self.label).finish_non_exhaustive()
    }
}

/// Open measurement on one profiler.
///
/// Dropping the handle stops it, so an early return or a failing call still
/// closes the interval.
#[must_use = "dropping the handle stops the measurement immediately"]
#[derive(Debug, Default)]
pub struct MeasurementHandle {
    profiler: Option<Arc<Profiler>>,
}

impl MeasurementHandle {
    pub(crate) fn started(profiler: Arc<Profiler>) -> Self {
        profiler.start();
        Self { profiler: Some(profiler) }
    }

    /// Handle that records nothing.
    pub fn inert() -> Self {
        Self { profiler: None }
    }

    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.profiler.is_none()
    }

    pub fn key(&self) -> Option<&str> {
        self.profiler.as_deref().map(Profiler::key)
    }

    pub fn stop(mut self) {
        if let Some(profiler) = self.profiler.take() {
            profiler.stop();
        }
    }
}

impl Drop for MeasurementHandle {
    fn drop(&mut self) {
        if let Some(profiler) = self.profiler.take() {
            profiler.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling::clock::ManualClock;

    fn profiler(capacity: usize) -> (Arc<ManualClock>, Arc<Profiler>) {
        let clock = Arc::new(ManualClock::new());
        let profiler = Arc::new(Profiler::new("Pawn.Tick", "Pawn.Tick", None, capacity, clock.clone()));
        (clock, profiler)
    }

    #[test]
    fn test_single_interval() {
        let (clock, profiler) = profiler(10);
        profiler.start();
        clock.advance_ms(4.0);
        profiler.stop();

        assert_eq!(profiler.history(), vec![Sample { duration_ms: 4.0, hits: 1 }]);
        assert_eq!(profiler.depth(), 0);
    }

    #[test]
    fn test_nested_calls_commit_once() {
        let (clock, profiler) = profiler(10);
        profiler.start();
        clock.advance_ms(1.0);
        profiler.start();
        clock.advance_ms(2.0);
        profiler.stop();
        clock.advance_ms(3.0);
        profiler.stop();

        let history = profiler.history();
        assert_eq!(history.len(), 1);
        // Outer interval only: 1 + 2 + 3, not 6 + 2
        assert!((history[0].duration_ms - 6.0).abs() < 1e-9);
        assert_eq!(history[0].hits, 2);
    }

    #[test]
    fn test_unbalanced_stop_ignored() {
        let (_, profiler) = profiler(10);
        profiler.stop();
        assert!(profiler.history().is_empty());
        assert_eq!(profiler.depth(), 0);
    }

    #[test]
    fn test_take_interval_resets() {
        let (clock, profiler) = profiler(10);
        for _ in 0..3 {
            profiler.start();
            clock.advance_ms(2.0);
            profiler.stop();
        }
        let (ms, hits) = profiler.take_interval();
        assert!((ms - 6.0).abs() < 1e-9);
        assert_eq!(hits, 3);
        assert_eq!(profiler.take_interval(), (0.0, 0));
    }

    #[test]
    fn test_handle_drop_stops() {
        let (clock, profiler) = profiler(10);
        {
            let _handle = MeasurementHandle::started(Arc::clone(&profiler));
            clock.advance_ms(1.5);
        }
        assert_eq!(profiler.history_len(), 1);
    }

    #[test]
    fn test_inert_handle_records_nothing() {
        let handle = MeasurementHandle::inert();
        assert!(handle.is_inert());
        assert_eq!(handle.key(), None);
        handle.stop();
    }

    #[test]
    fn test_reset_and_halt() {
        let (clock, profiler) = profiler(10);
        profiler.start();
        clock.advance_ms(1.0);
        profiler.stop();
        profiler.start();
        profiler.halt();
        assert!(!profiler.is_active());
        assert_eq!(profiler.depth(), 0);

        profiler.reset();
        assert!(profiler.history().is_empty());
    }
}
