//! Global patch lifecycle
//!
//! ## State Machine
//!
//! ```text
//!                 request_patch                 success
//!  Uninitialised ──────────────► Patching ─────────────────► Open
//!        ▲                          │  ▲                      │
//!        │                  unpatch │  │ request_patch        │ request_unpatch
//!        │                          ▼  │ (cancels teardown)   ▼
//!        │        complete     ┌──────────────────┐◄──────────┘
//!        └──────── Unpatching ◄┤ UnpatchingQueued │
//!                    worker    └──────────────────┘
//! ```
//!
//! Teardown runs on the worker pool so an unpatch request never blocks the
//! caller. Each queued teardown carries an epoch; a patch request arriving
//! while it is still queued bumps the epoch, which turns the queued task
//! into a no-op. A patch request arriving while teardown is already running
//! waits for it to finish and then patches from a clean table.
//!
//! A patch request reconciles the descriptor table to exactly the requested
//! set. Unrequested descriptors are removed, active ones with an unchanged
//! spec are kept, changed ones are replaced and missing ones are applied.
//! Each target is applied in isolation; a failure is logged and reported and
//! the rest of the batch proceeds.
//!
//! An unpatch requested while a pass is running wins: its teardown waits on
//! the descriptor table and removes everything the pass applied. Any other
//! patch request made while a pass is running is `Busy`.

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use perfscope_common::MethodId;

use super::catalog::{PatchKind, PatchSpec};
use super::interceptor::{Flow, Interceptor};
use crate::domain::{CurrentState, LifecycleError, PatchError, PatchTarget, Priority, RewriteError};
use crate::host::Program;
use crate::profiling::{MeasureSite, MeasurementHandle, ProfileRegistry};
use crate::rewrite::{CallRewriter, RewriteSummary};
use crate::workers::{panic_message, TaskHandle, WorkerPool};

/// One applied patch, owned by the lifecycle.
#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    pub target: PatchTarget,
    pub method: MethodId,
    pub interceptor: Interceptor,
    /// Spec the descriptor was applied from
    pub spec: PatchSpec,
    pub owner: Arc<str>,
    pub priority: Priority,
    /// Measurement key, for measuring patches
    pub key: Option<String>,
    /// An internal rewrite was installed alongside the interceptor
    pub rewrite: bool,
    pub applied: bool,
}

/// Outcome of one patch request
#[derive(Debug, Default, Clone)]
pub struct PatchReport {
    pub applied: Vec<PatchTarget>,
    pub retained: Vec<PatchTarget>,
    pub removed: Vec<PatchTarget>,
    pub failed: Vec<(PatchTarget, String)>,
}

impl PatchReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
struct LifecycleState {
    current: CurrentState,
    epoch: u64,
    teardown: Option<TaskHandle>,
    /// Token of the patch pass currently running
    pass: Option<u64>,
    next_pass: u64,
}

impl LifecycleState {
    fn admit_pass(&mut self) -> u64 {
        self.next_pass += 1;
        self.pass = Some(self.next_pass);
        self.current = CurrentState::Patching;
        self.next_pass
    }
}

/// Ends an admitted pass, also when it unwinds.
struct PassGuard<'a> {
    inner: &'a Inner,
    token: u64,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state.pass == Some(self.token) {
            state.pass = None;
        }
        if state.current == CurrentState::Patching {
            state.current = CurrentState::Open;
            self.inner.registry.set_collecting(true);
        } else {
            debug!("Unpatch requested during patching; leaving state {}", state.current);
        }
    }
}

struct Inner {
    program: Arc<Program>,
    registry: Arc<ProfileRegistry>,
    rewriter: Arc<CallRewriter>,
    owner: Arc<str>,
    state: Mutex<LifecycleState>,
    table: Mutex<HashMap<PatchTarget, PatchDescriptor>>,
}

pub struct PatchLifecycle {
    inner: Arc<Inner>,
    workers: Arc<WorkerPool>,
}

impl PatchLifecycle {
    pub fn new(
        program: Arc<Program>,
        registry: Arc<ProfileRegistry>,
        rewriter: Arc<CallRewriter>,
        workers: Arc<WorkerPool>,
        owner: &str,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                program,
                registry,
                rewriter,
                owner: Arc::from(owner),
                state: Mutex::new(LifecycleState::default()),
                table: Mutex::new(HashMap::new()),
            }),
            workers,
        }
    }

    #[must_use]
    pub fn state(&self) -> CurrentState {
        self.inner.state.lock().current
    }

    #[must_use]
    pub fn can_patch(&self) -> bool {
        self.state().can_patch()
    }

    #[must_use]
    pub fn can_cleanup(&self) -> bool {
        self.state().can_cleanup()
    }

    /// Handle of the queued or running teardown, if any
    #[must_use]
    pub fn pending_teardown(&self) -> Option<TaskHandle> {
        self.inner.state.lock().teardown.clone()
    }

    /// Make the active patch set exactly `specs`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Busy`] if another patch pass is running.
    /// Per-target failures are not errors; they are listed in the report.
    pub fn request_patch(&self, specs: &[PatchSpec]) -> Result<PatchReport, LifecycleError> {
        self.request_patch_with(specs, || {})
    }

    /// Like [`request_patch`](Self::request_patch), running `on_admit` once
    /// the pass is admitted and before any target is touched.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Busy`] if another patch pass is running; `on_admit`
    /// does not run then.
    pub fn request_patch_with<F>(&self, specs: &[PatchSpec], on_admit: F) -> Result<PatchReport, LifecycleError>
    where
        F: FnOnce(),
    {
        // No pass holds the table at admission, so taking it under the state
        // lock is brief. A teardown queued mid-pass then drains only after
        // the pass finishes.
        let (token, mut table) = loop {
            let mut state = self.inner.state.lock();
            if state.pass.is_some() {
                return Err(LifecycleError::Busy(state.current));
            }
            match state.current {
                CurrentState::Patching => return Err(LifecycleError::Busy(CurrentState::Patching)),
                CurrentState::Unpatching => {
                    let running = state.teardown.clone();
                    drop(state);
                    match running {
                        Some(handle) => {
                            debug!("Patch request waiting for running teardown");
                            handle.wait();
                        }
                        None => std::thread::yield_now(),
                    }
                }
                CurrentState::UnpatchingQueued => {
                    state.epoch += 1;
                    state.teardown = None;
                    info!("Patch request cancelled the queued teardown");
                    break (state.admit_pass(), self.inner.table.lock());
                }
                CurrentState::Open | CurrentState::Uninitialised => {
                    break (state.admit_pass(), self.inner.table.lock());
                }
            }
        };

        let pass = PassGuard { inner: &self.inner, token };
        on_admit();
        let report = self.inner.reconcile(&mut table, specs);
        drop(table);
        drop(pass);

        info!(
            "Patch pass: {} applied, {} retained, {} removed, {} failed",
            report.applied.len(),
            report.retained.len(),
            report.removed.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Queue removal of every patch and rewrite.
    ///
    /// Stops collection and drops all profilers immediately. When a teardown
    /// is already queued or running its handle is returned instead.
    pub fn request_unpatch(&self) -> TaskHandle {
        let mut state = self.inner.state.lock();
        if !state.current.can_cleanup() {
            return state.teardown.clone().unwrap_or_else(TaskHandle::finished);
        }

        self.inner.registry.set_collecting(false);
        self.inner.registry.reset();

        state.epoch += 1;
        let epoch = state.epoch;
        state.current = CurrentState::UnpatchingQueued;

        let inner = Arc::clone(&self.inner);
        let handle = self.workers.submit(move || inner.teardown(epoch));
        state.teardown = Some(handle.clone());
        debug!("Teardown queued (epoch {epoch})");
        handle
    }

    /// Rewrite the call sites inside `target` outside of any patch spec.
    pub fn install_rewrite(&self, target: &PatchTarget) -> Result<RewriteSummary, RewriteError> {
        self.inner.rewriter.install(target)
    }

    pub fn install_rewrite_method(&self, method: MethodId) -> Result<RewriteSummary, RewriteError> {
        self.inner.rewriter.install_method(method)
    }

    pub fn remove_rewrite(&self, target: &PatchTarget) -> Result<bool, RewriteError> {
        self.inner.rewriter.remove(target)
    }

    #[must_use]
    pub fn rewriter(&self) -> &Arc<CallRewriter> {
        &self.inner.rewriter
    }

    /// Active targets, sorted
    #[must_use]
    pub fn active_targets(&self) -> Vec<PatchTarget> {
        let mut targets: Vec<_> = self.inner.table.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    #[must_use]
    pub fn descriptor(&self, target: &PatchTarget) -> Option<PatchDescriptor> {
        self.inner.table.lock().get(target).cloned()
    }

    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.inner.table.lock().len()
    }
}

impl Inner {
    fn reconcile(&self, table: &mut HashMap<PatchTarget, PatchDescriptor>, specs: &[PatchSpec]) -> PatchReport {
        let mut report = PatchReport::default();
        let mut seen = HashSet::new();
        let requested: Vec<&PatchSpec> = specs
            .iter()
            .filter(|spec| {
                let first = seen.insert(spec.target.clone());
                if !first {
                    warn!("Duplicate patch spec for {} ignored", spec.target);
                }
                first
            })
            .collect();

        let stale: Vec<PatchTarget> = table.keys().filter(|t| !seen.contains(*t)).cloned().collect();
        for target in stale {
            if let Some(descriptor) = table.remove(&target) {
                self.remove_descriptor(&descriptor);
                report.removed.push(target);
            }
        }

        for spec in requested {
            match table.get(&spec.target) {
                Some(active) if active.spec.same_patch(spec) => {
                    report.retained.push(spec.target.clone());
                    continue;
                }
                Some(_) => {
                    // Same target, different patch: replace it
                    if let Some(descriptor) = table.remove(&spec.target) {
                        self.remove_descriptor(&descriptor);
                        report.removed.push(spec.target.clone());
                    }
                }
                None => {}
            }
            match panic::catch_unwind(AssertUnwindSafe(|| self.apply_one(spec))) {
                Ok(Ok(descriptor)) => {
                    table.insert(spec.target.clone(), descriptor);
                    report.applied.push(spec.target.clone());
                }
                Ok(Err(e)) => {
                    warn!("Skipping {}: {e}", spec.target);
                    report.failed.push((spec.target.clone(), e.to_string()));
                }
                Err(payload) => {
                    let e = PatchError::Panicked { target: spec.target.clone(), message: panic_message(payload.as_ref()) };
                    warn!("Skipping {}: {e}", spec.target);
                    // The target has no descriptor here, so anything this owner left on it is stray
                    if let Some(method) = self.program.resolve(&spec.target) {
                        self.program.remove_interceptors(method, &self.owner);
                    }
                    report.failed.push((spec.target.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn apply_one(&self, spec: &PatchSpec) -> Result<PatchDescriptor, PatchError> {
        let target = &spec.target;
        let method = self.program.resolve(target).ok_or_else(|| PatchError::MissingMember(target.clone()))?;
        let body = self.program.body(method).ok_or_else(|| PatchError::MissingMember(target.clone()))?;
        if body.is_abstract() {
            return Err(PatchError::UnsupportedShape(target.clone()));
        }

        let (interceptor, key) = match &spec.kind {
            PatchKind::Measure { key, label } => {
                (measure_interceptor(&self.owner, spec.priority, &self.registry, key, label.as_deref()), Some(key.clone()))
            }
            PatchKind::KillSwitch(flag) => {
                let flag = Arc::clone(flag);
                let interceptor = Interceptor::new(&self.owner, spec.priority).on_entry(move |_, _| {
                    if flag.load(Ordering::Relaxed) {
                        Flow::SkipOriginal
                    } else {
                        Flow::Continue
                    }
                });
                (interceptor, None)
            }
            PatchKind::Custom(custom) => {
                let mut interceptor = custom.clone().owned_by(&self.owner);
                interceptor.priority = spec.priority;
                (interceptor, None)
            }
        };

        self.program.install_interceptor(method, target, interceptor.clone())?;

        let rewrite = spec.rewrite_internals
            && match panic::catch_unwind(AssertUnwindSafe(|| self.rewriter.install_method(method))) {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    warn!("Internal rewrite of {target} failed, measuring the method only: {e}");
                    false
                }
                Err(payload) => {
                    warn!(
                        "Internal rewrite of {target} panicked, measuring the method only: {}",
                        panic_message(payload.as_ref())
                    );
                    false
                }
            };

        debug!("Applied {target} at {}", spec.priority);
        Ok(PatchDescriptor {
            target: target.clone(),
            method,
            interceptor,
            spec: spec.clone(),
            owner: Arc::clone(&self.owner),
            priority: spec.priority,
            key,
            rewrite,
            applied: true,
        })
    }

    fn remove_descriptor(&self, descriptor: &PatchDescriptor) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if !self.program.remove_interceptors(descriptor.method, &descriptor.owner) {
                debug!("{} had no interceptor left to remove", descriptor.target);
            }
            if descriptor.rewrite {
                if let Err(e) = self.rewriter.remove_method(descriptor.method) {
                    warn!("Failed to restore body of {}: {e}", descriptor.target);
                }
            }
        }));
        if let Err(payload) = outcome {
            warn!("Removing {} panicked: {}", descriptor.target, panic_message(payload.as_ref()));
        }
    }

    fn teardown(&self, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.current != CurrentState::UnpatchingQueued || state.epoch != epoch {
                debug!("Teardown for epoch {epoch} is stale, skipping");
                return;
            }
            state.current = CurrentState::Unpatching;
        }

        let drained: Vec<PatchDescriptor> = self.table.lock().drain().map(|(_, d)| d).collect();
        for descriptor in &drained {
            self.remove_descriptor(descriptor);
        }
        let restored = panic::catch_unwind(AssertUnwindSafe(|| self.rewriter.remove_all())).unwrap_or_else(|payload| {
            warn!("Restoring rewrites panicked: {}", panic_message(payload.as_ref()));
            0
        });
        info!("Teardown removed {} patches and {restored} rewrites", drained.len());

        let mut state = self.state.lock();
        state.current = CurrentState::Uninitialised;
        state.teardown = None;
    }
}

/// Interceptor that times the original body under `key`.
fn measure_interceptor(
    owner: &str,
    priority: Priority,
    registry: &Arc<ProfileRegistry>,
    key: &str,
    label: Option<&str>,
) -> Interceptor {
    let registry = Arc::clone(registry);
    let key = key.to_string();
    let label = label.map_or_else(|| key.clone(), str::to_string);

    Interceptor::new(owner, priority)
        .on_entry(move |site, state| {
            state.put(registry.start(&key, || label.clone(), Some(MeasureSite::new(site.method, site.target))));
            Flow::Continue
        })
        .on_exit(|_, state, _| {
            if let Some(handle) = state.take::<MeasurementHandle>() {
                handle.stop();
            }
        })
}
