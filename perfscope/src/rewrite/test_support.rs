//! Strategy doubles for lifecycle tests that need a rewrite to stall or fail

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};
use perfscope_common::{Instruction, MethodId, MethodRef};

use super::program_strategy::ProgramStrategy;
use super::strategy::{ReplacementSpec, RewriteStrategy};
use crate::domain::{PatchTarget, RewriteError};

/// Test side of a [`GatedStrategy`].
pub(crate) struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    /// Block until the first body read is parked.
    pub(crate) fn wait_entered(&self) {
        let _ = self.entered.recv();
    }

    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Delegates to the live program, parking the first body read until released.
pub(crate) struct GatedStrategy {
    inner: ProgramStrategy,
    armed: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl GatedStrategy {
    pub(crate) fn new(inner: ProgramStrategy) -> (Self, Gate) {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let strategy = Self { inner, armed: AtomicBool::new(true), entered: entered_tx, release: release_rx };
        (strategy, Gate { entered: entered_rx, release: release_tx })
    }
}

impl RewriteStrategy for GatedStrategy {
    fn resolve(&self, target: &PatchTarget) -> Option<MethodId> {
        self.inner.resolve(target)
    }

    fn describe(&self, method: MethodId) -> Option<MethodRef> {
        self.inner.describe(method)
    }

    fn read_body(&self, method: MethodId) -> Result<Vec<Instruction>, RewriteError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
        self.inner.read_body(method)
    }

    fn define_replacement(&self, spec: &ReplacementSpec) -> Result<MethodId, RewriteError> {
        self.inner.define_replacement(spec)
    }

    fn write_body(&self, method: MethodId, code: Vec<Instruction>) -> Result<(), RewriteError> {
        self.inner.write_body(method, code)
    }
}

/// Panics on every body read.
pub(crate) struct PanickingStrategy(pub(crate) ProgramStrategy);

impl RewriteStrategy for PanickingStrategy {
    fn resolve(&self, target: &PatchTarget) -> Option<MethodId> {
        self.0.resolve(target)
    }

    fn describe(&self, method: MethodId) -> Option<MethodRef> {
        self.0.describe(method)
    }

    fn read_body(&self, _method: MethodId) -> Result<Vec<Instruction>, RewriteError> {
        panic!("body unreadable")
    }

    fn define_replacement(&self, spec: &ReplacementSpec) -> Result<MethodId, RewriteError> {
        self.0.define_replacement(spec)
    }

    fn write_body(&self, method: MethodId, code: Vec<Instruction>) -> Result<(), RewriteError> {
        self.0.write_body(method, code)
    }
}
