//! Engine context
//!
//! One [`Engine`] owns every long-lived component: the profiler registry,
//! the worker pool, the call rewriter, the patch lifecycle, the statistics
//! engine and the mode catalog. Nothing is global, so tests can run any
//! number of independent engines side by side.
//!
//! ```text
//!   Engine
//!    ├─ ProfileRegistry ◄── measurement hooks, rewrite wrappers, Sampler
//!    ├─ WorkerPool ◄─────── teardown, statistics
//!    ├─ CallRewriter ─────► RewriteStrategy ─► Program
//!    ├─ PatchLifecycle ───► Program (interceptors)
//!    ├─ StatsEngine ──────► ProfileRegistry (history copies)
//!    └─ ModeCatalog
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;
use perfscope_common::OVERVIEW_KEY;

use crate::analysis::{StatsEngine, StatsStatus};
use crate::config::EngineConfig;
use crate::domain::{ConfigError, CurrentState, ExportError, LifecycleError, PatchTarget, RewriteError};
use crate::export::HistoryExporter;
use crate::host::Program;
use crate::patching::{ModeCatalog, ModeSummary, PatchLifecycle, PatchReport, PatchSpec, ProfileMode};
use crate::profiling::{Clock, MeasureSite, MeasurementHandle, MonotonicClock, ProfileLog, ProfileRegistry, Sampler};
use crate::rewrite::{CallRewriter, ProgramStrategy, RewriteStrategy, RewriteSummary};
use crate::workers::{TaskHandle, WorkerPool};

pub struct Engine {
    config: EngineConfig,
    program: Arc<Program>,
    registry: Arc<ProfileRegistry>,
    lifecycle: PatchLifecycle,
    stats: StatsEngine,
    catalog: Mutex<ModeCatalog>,
    current_mode: Mutex<Option<String>>,
}

impl Engine {
    /// Engine over `program` with the monotonic clock and live rewriting.
    pub fn new(config: EngineConfig, program: Arc<Program>) -> Result<Self, ConfigError> {
        Self::with_clock(config, program, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: EngineConfig,
        program: Arc<Program>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Self::with_strategy(config, program, clock, |program, registry| {
            Arc::new(ProgramStrategy::new(Arc::clone(program), Arc::clone(registry)))
        })
    }

    /// Engine whose call rewriter goes through the strategy built by `make_strategy`.
    pub fn with_strategy<F>(
        config: EngineConfig,
        program: Arc<Program>,
        clock: Arc<dyn Clock>,
        make_strategy: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnOnce(&Arc<Program>, &Arc<ProfileRegistry>) -> Arc<dyn RewriteStrategy>,
    {
        config.validate()?;

        let registry = Arc::new(ProfileRegistry::new(config.history_capacity, clock));
        let workers = Arc::new(WorkerPool::new(config.worker_threads));
        let rewriter = Arc::new(CallRewriter::new(make_strategy(&program, &registry)));
        let lifecycle = PatchLifecycle::new(
            Arc::clone(&program),
            Arc::clone(&registry),
            rewriter,
            Arc::clone(&workers),
            &config.owner,
        );
        let stats = StatsEngine::new(Arc::clone(&registry), workers, config.outlier_sigma);

        info!(
            "Engine ready: capacity {}, {} workers, owner {}",
            config.history_capacity, config.worker_threads, config.owner
        );

        Ok(Self {
            config,
            program,
            registry,
            lifecycle,
            stats,
            catalog: Mutex::new(ModeCatalog::new()),
            current_mode: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &PatchLifecycle {
        &self.lifecycle
    }

    // ------------------------------------------------------------------
    // Measurement
    // ------------------------------------------------------------------

    /// Open a measurement under `key`, labelled with the key itself.
    pub fn start_measurement(&self, key: &str, site: Option<MeasureSite<'_>>) -> MeasurementHandle {
        self.registry.start(key, || key.to_string(), site)
    }

    /// Open a measurement; `label` runs only when `key` is new.
    pub fn start_measurement_with<F>(&self, key: &str, label: F, site: Option<MeasureSite<'_>>) -> MeasurementHandle
    where
        F: FnOnce() -> String,
    {
        self.registry.start(key, label, site)
    }

    pub fn current_logs(&self) -> Arc<Vec<ProfileLog>> {
        self.registry.current_logs()
    }

    pub fn filtered_logs(&self, query: &str) -> Vec<ProfileLog> {
        self.registry.filtered_logs(query)
    }

    pub fn refresh_logs(&self) -> Arc<Vec<ProfileLog>> {
        self.registry.refresh_logs()
    }

    /// Clear every key's history, e.g. after a change in what a key measures.
    pub fn reset_histories(&self) {
        self.registry.reset_histories();
        self.stats.clear();
    }

    /// Sum of the current logs under the overview key.
    pub fn overview_log(&self) -> ProfileLog {
        let logs = self.registry.current_logs();
        ProfileLog {
            key: OVERVIEW_KEY.to_string(),
            label: self.current_mode().unwrap_or_else(|| OVERVIEW_KEY.to_string()),
            last_duration_ms: logs.iter().map(|l| l.last_duration_ms).sum(),
            percent: if logs.is_empty() { 0.0 } else { 1.0 },
            calls: logs.iter().fold(0u32, |acc, l| acc.saturating_add(l.calls)),
            target: None,
        }
    }

    pub fn statistics(&self, key: &str) -> StatsStatus {
        self.stats.get(key)
    }

    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    /// Start the background log refresh at the configured interval.
    pub fn spawn_sampler(&self) -> std::io::Result<Sampler> {
        Sampler::spawn(Arc::clone(&self.registry), Duration::from_millis(self.config.sampling_interval_ms))
    }

    // ------------------------------------------------------------------
    // Patching
    // ------------------------------------------------------------------

    pub fn request_patch(&self, specs: &[PatchSpec]) -> Result<PatchReport, LifecycleError> {
        self.lifecycle.request_patch(specs)
    }

    pub fn request_unpatch(&self) -> TaskHandle {
        let handle = self.lifecycle.request_unpatch();
        self.stats.clear();
        handle
    }

    pub fn state(&self) -> CurrentState {
        self.lifecycle.state()
    }

    pub fn can_patch(&self) -> bool {
        self.lifecycle.can_patch()
    }

    pub fn can_cleanup(&self) -> bool {
        self.lifecycle.can_cleanup()
    }

    pub fn install_internal_rewrite(&self, target: &PatchTarget) -> Result<RewriteSummary, RewriteError> {
        self.lifecycle.install_rewrite(target)
    }

    pub fn remove_internal_rewrite(&self, target: &PatchTarget) -> Result<bool, RewriteError> {
        self.lifecycle.remove_rewrite(target)
    }

    /// Rewrite the body of the method measured under `key`.
    ///
    /// Looks first at callees the rewriter has already wrapped, then at the
    /// method recorded on the key's profiler.
    pub fn install_internal_rewrite_for_key(&self, key: &str) -> Result<RewriteSummary, RewriteError> {
        let method = self
            .lifecycle
            .rewriter()
            .method_for_key(key)
            .or_else(|| self.registry.get(key)?.method())
            .ok_or_else(|| RewriteError::UnknownMethod(key.to_string()))?;
        self.lifecycle.install_rewrite_method(method)
    }

    // ------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------

    pub fn register_mode(&self, mode: ProfileMode) {
        self.catalog.lock().register(mode);
    }

    /// Reset measurement state and patch exactly the targets of `name`.
    pub fn switch_mode(&self, name: &str) -> Result<PatchReport, LifecycleError> {
        let specs = self
            .catalog
            .lock()
            .get(name)
            .map(|mode| mode.specs.clone())
            .ok_or_else(|| LifecycleError::UnknownMode(name.to_string()))?;

        // Reset only once the pass is admitted; a busy lifecycle keeps the
        // current mode's histories
        let report = self.lifecycle.request_patch_with(&specs, || {
            self.registry.reset();
            self.stats.clear();
        })?;
        *self.current_mode.lock() = Some(name.to_string());
        info!("Switched to mode {name}");
        Ok(report)
    }

    /// Create (or replace) a dynamic mode measuring `targets`.
    pub fn make_mode(&self, name: &str, targets: &[PatchTarget]) -> ModeSummary {
        self.catalog.lock().make_mode(name, targets).summary()
    }

    /// Remove a dynamic mode; built-in modes are kept.
    pub fn remove_mode(&self, name: &str) -> Option<ProfileMode> {
        let removed = self.catalog.lock().remove_mode(name)?;
        let mut current = self.current_mode.lock();
        if current.as_deref() == Some(name) {
            *current = None;
        }
        Some(removed)
    }

    pub fn current_mode(&self) -> Option<String> {
        self.current_mode.lock().clone()
    }

    pub fn modes(&self) -> Vec<ModeSummary> {
        self.catalog.lock().iter().map(ProfileMode::summary).collect()
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Write every profiler's history to `path`; returns the row count.
    pub fn export_history(&self, path: &Path) -> Result<usize, ExportError> {
        let exporter = HistoryExporter::from_registry(&self.registry);
        exporter.export_to_path(path)?;
        info!("Exported {} history rows to {}", exporter.row_count(), path.display());
        Ok(exporter.row_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::SampleProgram;
    use crate::profiling::ManualClock;
    use crate::rewrite::test_support::GatedStrategy;
    use std::sync::atomic::AtomicBool;

    fn engine(sample: &SampleProgram) -> Engine {
        let engine = Engine::with_clock(
            EngineConfig::default(),
            Arc::clone(&sample.program),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        for mode in SampleProgram::modes(&Arc::new(AtomicBool::new(false))) {
            engine.register_mode(mode);
        }
        engine
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sample = SampleProgram::build(1);
        let config = EngineConfig { history_capacity: 0, ..EngineConfig::default() };
        assert!(Engine::new(config, Arc::clone(&sample.program)).is_err());
    }

    #[test]
    fn test_switch_mode_patches_its_targets() {
        let sample = SampleProgram::build(3);
        let engine = engine(&sample);

        let report = engine.switch_mode("Frame").unwrap();
        assert!(report.is_clean());
        assert_eq!(engine.state(), CurrentState::Open);
        assert_eq!(engine.current_mode().as_deref(), Some("Frame"));

        sample.run_frame().unwrap();
        let logs = engine.refresh_logs();
        let keys: Vec<&str> = logs.iter().map(|l| l.key.as_str()).collect();
        assert!(keys.contains(&"Game.Frame"));
        assert!(keys.contains(&"Music.Update"));
    }

    #[test]
    fn test_busy_switch_keeps_histories() {
        let sample = SampleProgram::build(2);
        let mut gate = None;
        let engine = Engine::with_strategy(
            EngineConfig::default(),
            Arc::clone(&sample.program),
            Arc::new(ManualClock::new()),
            |program, registry| {
                let (strategy, g) = GatedStrategy::new(ProgramStrategy::new(Arc::clone(program), Arc::clone(registry)));
                gate = Some(g);
                Arc::new(strategy) as Arc<dyn RewriteStrategy>
            },
        )
        .unwrap();
        let gate = gate.unwrap();
        for mode in SampleProgram::modes(&Arc::new(AtomicBool::new(false))) {
            engine.register_mode(mode);
        }

        engine.switch_mode("Frame").unwrap();
        sample.run_frame().unwrap();
        let _ = engine.stats().request("Game.Frame").unwrap().wait();

        let rewrite_tick = [PatchSpec::measure(PatchTarget::new("World", "Tick")).with_internal_rewrite()];
        std::thread::scope(|s| {
            let pass = s.spawn(|| engine.request_patch(&rewrite_tick));
            gate.wait_entered();

            let err = engine.switch_mode("Pawns").unwrap_err();
            assert!(matches!(err, LifecycleError::Busy(_)));
            assert_eq!(engine.registry().get("Game.Frame").map(|p| p.history_len()), Some(1));
            assert!(engine.stats().snapshot("Game.Frame").is_some());
            assert_eq!(engine.current_mode().as_deref(), Some("Frame"));

            gate.release();
            pass.join().unwrap().unwrap();
        });
        assert_eq!(engine.state(), CurrentState::Open);
    }

    #[test]
    fn test_switch_to_unknown_mode() {
        let sample = SampleProgram::build(1);
        let engine = engine(&sample);
        let err = engine.switch_mode("Nope").unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownMode(_)));
        assert_eq!(engine.state(), CurrentState::Uninitialised);
    }

    #[test]
    fn test_switch_mode_reconciles_targets() {
        let sample = SampleProgram::build(1);
        let engine = engine(&sample);

        engine.switch_mode("Frame").unwrap();
        let report = engine.switch_mode("KillMusic").unwrap();

        assert_eq!(report.retained, vec![PatchTarget::new("Game", "Frame")]);
        assert!(report.removed.contains(&PatchTarget::new("Rng", "Next")));
        assert_eq!(engine.lifecycle().descriptor_count(), 2);
    }

    #[test]
    fn test_dynamic_mode_lifecycle() {
        let sample = SampleProgram::build(1);
        let engine = engine(&sample);

        let summary = engine.make_mode("Mine", &[PatchTarget::new("Rng", "Next")]);
        assert!(summary.dynamic);
        engine.switch_mode("Mine").unwrap();
        assert!(engine.remove_mode("Mine").is_some());
        assert_eq!(engine.current_mode(), None);
        assert!(engine.remove_mode("Frame").is_none());
    }

    #[test]
    fn test_manual_measurement_when_collecting() {
        let sample = SampleProgram::build(0);
        let engine = engine(&sample);

        // Not collecting until a patch pass opens the window
        assert!(engine.start_measurement("Manual", None).is_inert());

        engine.switch_mode("Home").unwrap();
        let handle = engine.start_measurement_with("Manual", || "Manual work".to_string(), None);
        assert!(!handle.is_inert());
        handle.stop();
        assert_eq!(engine.registry().get("Manual").unwrap().label(), "Manual work");
    }

    #[test]
    fn test_rewrite_for_key_uses_profiler_target() {
        let sample = SampleProgram::build(1);
        let engine = engine(&sample);
        engine.switch_mode("Frame").unwrap();
        sample.run_frame().unwrap();

        let summary = engine.install_internal_rewrite_for_key("Game.Frame");
        // Game.Frame is a native body, there is nothing to rewrite
        assert!(matches!(summary, Err(RewriteError::NoBody(_))));
        assert!(matches!(
            engine.install_internal_rewrite_for_key("Never.Seen"),
            Err(RewriteError::UnknownMethod(_))
        ));
    }

    #[test]
    fn test_reset_histories_keeps_keys() {
        let sample = SampleProgram::build(2);
        let engine = engine(&sample);
        engine.switch_mode("Frame").unwrap();
        sample.run_frame().unwrap();

        engine.reset_histories();
        let frame = engine.registry().get("Game.Frame").unwrap();
        assert_eq!(frame.history_len(), 0);
        sample.run_frame().unwrap();
        assert_eq!(frame.history_len(), 1);
    }

    #[test]
    fn test_overview_sums_logs() {
        let sample = SampleProgram::build(2);
        let engine = engine(&sample);
        assert_eq!(engine.overview_log().percent, 0.0);

        engine.switch_mode("Frame").unwrap();
        sample.run_frame().unwrap();
        engine.refresh_logs();

        let overview = engine.overview_log();
        assert_eq!(overview.key, OVERVIEW_KEY);
        assert_eq!(overview.label, "Frame");
        let calls: u32 = engine.current_logs().iter().map(|l| l.calls).sum();
        assert_eq!(overview.calls, calls);
    }
}
