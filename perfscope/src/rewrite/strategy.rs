//! Seam between the call-site rewriter and executable code
//!
//! The rewriter decides what to wrap; a [`RewriteStrategy`] performs the
//! reads and writes. [`ProgramStrategy`](super::ProgramStrategy) patches the
//! live host program, [`RecordingStrategy`] keeps bodies in its own table and
//! logs every request, for tests that must not touch executable code.

use std::collections::HashMap;

use parking_lot::Mutex;
use perfscope_common::{CallKind, Instruction, MethodId, MethodRef};

use super::signature::ReplacementSignature;
use crate::domain::{PatchTarget, RewriteError};

/// Everything a strategy needs to synthesize one wrapper
#[derive(Debug, Clone)]
pub struct ReplacementSpec {
    pub original: MethodId,
    pub original_ref: MethodRef,
    /// How the wrapper reaches the original
    pub kind: CallKind,
    pub signature: ReplacementSignature,
    pub key: String,
}

pub trait RewriteStrategy: Send + Sync {
    fn resolve(&self, target: &PatchTarget) -> Option<MethodId>;

    fn describe(&self, method: MethodId) -> Option<MethodRef>;

    /// Current instruction sequence of `method`
    fn read_body(&self, method: MethodId) -> Result<Vec<Instruction>, RewriteError>;

    /// Create the wrapper method and return its id
    fn define_replacement(&self, spec: &ReplacementSpec) -> Result<MethodId, RewriteError>;

    /// Replace the instruction sequence of `method`
    fn write_body(&self, method: MethodId, code: Vec<Instruction>) -> Result<(), RewriteError>;
}

/// Request observed by a [`RecordingStrategy`]
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteRequest {
    Read(MethodId),
    Define { key: String, wrapper: MethodId, kind: CallKind },
    Write(MethodId, Vec<Instruction>),
}

#[derive(Default)]
struct RecordingState {
    methods: HashMap<MethodId, (MethodRef, Option<Vec<Instruction>>)>,
    names: HashMap<PatchTarget, MethodId>,
    requests: Vec<RewriteRequest>,
    next_wrapper: u32,
    fail_writes: bool,
}

/// Strategy that rewrites nothing but its own method table.
#[derive(Default)]
pub struct RecordingStrategy {
    state: Mutex<RecordingState>,
}

impl RecordingStrategy {
    /// Wrapper ids start here so they never clash with declared methods
    pub const FIRST_WRAPPER_ID: u32 = 10_000;

    #[must_use]
    pub fn new() -> Self {
        let strategy = Self::default();
        strategy.state.lock().next_wrapper = Self::FIRST_WRAPPER_ID;
        strategy
    }

    /// Declare a method; `code` is `None` for methods without a body.
    #[must_use]
    pub fn with_method(self, id: MethodId, method: MethodRef, code: Option<Vec<Instruction>>) -> Self {
        {
            let mut state = self.state.lock();
            state.names.insert(PatchTarget::from(&method), id);
            state.methods.insert(id, (method, code));
        }
        self
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RewriteRequest> {
        self.state.lock().requests.clone()
    }

    #[must_use]
    pub fn body(&self, id: MethodId) -> Option<Vec<Instruction>> {
        self.state.lock().methods.get(&id).and_then(|(_, code)| code.clone())
    }
}

impl RewriteStrategy for RecordingStrategy {
    fn resolve(&self, target: &PatchTarget) -> Option<MethodId> {
        self.state.lock().names.get(target).copied()
    }

    fn describe(&self, method: MethodId) -> Option<MethodRef> {
        self.state.lock().methods.get(&method).map(|(m, _)| m.clone())
    }

    fn read_body(&self, method: MethodId) -> Result<Vec<Instruction>, RewriteError> {
        let mut state = self.state.lock();
        state.requests.push(RewriteRequest::Read(method));
        match state.methods.get(&method) {
            Some((_, Some(code))) => Ok(code.clone()),
            Some((m, None)) => Err(RewriteError::NoBody(m.to_string())),
            None => Err(RewriteError::UnknownMethod(method.to_string())),
        }
    }

    fn define_replacement(&self, spec: &ReplacementSpec) -> Result<MethodId, RewriteError> {
        let mut state = self.state.lock();
        let wrapper = MethodId(state.next_wrapper);
        state.next_wrapper += 1;
        state.methods.insert(wrapper, (spec.signature.as_method_ref(), None));
        state.requests.push(RewriteRequest::Define { key: spec.key.clone(), wrapper, kind: spec.kind });
        Ok(wrapper)
    }

    fn write_body(&self, method: MethodId, code: Vec<Instruction>) -> Result<(), RewriteError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(RewriteError::StrategyFailed(format!("write to {method} refused")));
        }
        state.requests.push(RewriteRequest::Write(method, code.clone()));
        match state.methods.get_mut(&method) {
            Some((_, slot)) => {
                *slot = Some(code);
                Ok(())
            }
            None => Err(RewriteError::UnknownMethod(method.to_string())),
        }
    }
}
