//! Background statistics with single-flight refresh.
//!
//! ```text
//!   get(key) ──► snapshot map (read lock, clone Arc) ──► Ready | Pending
//!      │
//!      └─► request(key): in_flight false→true?  ── no ──► coalesced
//!                              │ yes
//!                              ▼
//!                  worker: copy history → compute → swap Arc into map
//!                              │
//!                              └─► in_flight = false (always, even on panic)
//! ```
//!
//! Readers only ever clone an `Arc` out of the map, so they see either the
//! previous complete snapshot or the next one. A failed computation logs
//! and leaves the previous snapshot in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use super::log_stats::{compute, LogStatsSnapshot};
use crate::domain::StatsError;
use crate::profiling::ProfileRegistry;
use crate::workers::{TaskHandle, WorkerPool};

/// Result of a statistics lookup
#[derive(Debug, Clone)]
pub enum StatsStatus {
    Ready(Arc<LogStatsSnapshot>),
    /// No snapshot has been published for the key yet
    Pending,
}

impl StatsStatus {
    #[must_use]
    pub fn ready(&self) -> Option<&LogStatsSnapshot> {
        match self {
            StatsStatus::Ready(snapshot) => Some(snapshot),
            StatsStatus::Pending => None,
        }
    }
}

/// Clears the single-flight flag when the computation ends, however it ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StatsEngine {
    registry: Arc<ProfileRegistry>,
    workers: Arc<WorkerPool>,
    sigma: f64,
    in_flight: Arc<AtomicBool>,
    snapshots: Arc<RwLock<HashMap<String, Arc<LogStatsSnapshot>>>>,
}

impl StatsEngine {
    pub fn new(registry: Arc<ProfileRegistry>, workers: Arc<WorkerPool>, sigma: f64) -> Self {
        Self {
            registry,
            workers,
            sigma,
            in_flight: Arc::new(AtomicBool::new(false)),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Queue a recomputation for `key`.
    ///
    /// Returns `None` when a computation is already running; the request is
    /// coalesced into it rather than queued behind it.
    pub fn request(&self, key: &str) -> Option<TaskHandle> {
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("Statistics for {key} coalesced into the running computation");
            return None;
        }

        let guard = FlightGuard(Arc::clone(&self.in_flight));
        let registry = Arc::clone(&self.registry);
        let snapshots = Arc::clone(&self.snapshots);
        let sigma = self.sigma;
        let key = key.to_string();

        Some(self.workers.submit(move || {
            let _guard = guard;
            match Self::compute_for(&registry, &key, sigma) {
                Ok(snapshot) => {
                    snapshots.write().insert(key, Arc::new(snapshot));
                }
                Err(e) => warn!("Statistics for {key} failed, keeping previous snapshot: {e}"),
            }
        }))
    }

    fn compute_for(registry: &ProfileRegistry, key: &str, sigma: f64) -> Result<LogStatsSnapshot, StatsError> {
        let profiler = registry.get(key).ok_or_else(|| StatsError::UnknownKey(key.to_string()))?;
        // Copy under the profiler's lock, compute without it
        let history = profiler.history();
        compute(key, &history, sigma)
    }

    /// Latest snapshot for `key`, kicking a refresh when none is running.
    pub fn get(&self, key: &str) -> StatsStatus {
        if self.registry.get(key).is_none() {
            return StatsStatus::Pending;
        }
        let _ = self.request(key);
        self.snapshot(key).map_or(StatsStatus::Pending, StatsStatus::Ready)
    }

    /// Latest published snapshot without triggering a refresh.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<Arc<LogStatsSnapshot>> {
        self.snapshots.read().get(key).cloned()
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Forget every published snapshot.
    pub fn clear(&self) {
        self.snapshots.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling::ManualClock;
    use crate::workers::TaskOutcome;

    fn setup() -> (Arc<ManualClock>, Arc<ProfileRegistry>, StatsEngine) {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(ProfileRegistry::new(100, clock.clone()));
        registry.set_collecting(true);
        let engine = StatsEngine::new(Arc::clone(&registry), Arc::new(WorkerPool::new(1)), 2.0);
        (clock, registry, engine)
    }

    fn record(clock: &ManualClock, registry: &ProfileRegistry, key: &str, ms: f64) {
        let handle = registry.start(key, || key.to_string(), None);
        clock.advance_ms(ms);
        handle.stop();
    }

    #[test]
    fn test_unknown_key_pending() {
        let (_, _, engine) = setup();
        assert!(matches!(engine.get("Missing"), StatsStatus::Pending));
        assert!(!engine.is_in_flight());
    }

    #[test]
    fn test_request_publishes_snapshot() {
        let (clock, registry, engine) = setup();
        for ms in [1.0, 2.0, 3.0] {
            record(&clock, &registry, "Key", ms);
        }

        let handle = engine.request("Key").expect("nothing in flight");
        assert_eq!(handle.wait(), TaskOutcome::Completed);

        let snapshot = engine.snapshot("Key").unwrap();
        assert_eq!(snapshot.entries, 3);
        assert!((snapshot.total_time - 6.0).abs() < 1e-9);
        assert!(!engine.is_in_flight());
    }

    #[test]
    fn test_single_flight_coalesces() {
        let (clock, registry, engine) = setup();
        record(&clock, &registry, "Key", 1.0);

        // Occupy the only worker so the first request stays in flight
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let blocker = engine.workers.submit(move || {
            let _ = rx.recv();
        });

        let first = engine.request("Key");
        assert!(first.is_some());
        assert!(engine.request("Key").is_none());
        assert!(engine.is_in_flight());

        tx.send(()).unwrap();
        blocker.wait();
        first.unwrap().wait();
        assert!(!engine.is_in_flight());
        assert!(engine.request("Key").is_some());
    }

    #[test]
    fn test_failure_keeps_previous_snapshot() {
        let (clock, registry, engine) = setup();
        record(&clock, &registry, "Key", 4.0);
        engine.request("Key").unwrap().wait();
        let before = engine.snapshot("Key").unwrap();

        // The key vanishes: the next computation fails with UnknownKey
        registry.reset();
        assert_eq!(engine.request("Key").unwrap().wait(), TaskOutcome::Completed);

        let after = engine.snapshot("Key").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!engine.is_in_flight());
    }
}
