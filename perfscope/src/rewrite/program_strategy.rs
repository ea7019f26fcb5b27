//! Rewrite strategy that patches the live host program

use std::sync::Arc;

use perfscope_common::{CallKind, Instruction, MethodId, MethodRef};

use super::strategy::{ReplacementSpec, RewriteStrategy};
use crate::domain::{PatchTarget, RewriteError};
use crate::host::{MethodBody, Program};
use crate::profiling::{MeasureSite, ProfileRegistry};

pub struct ProgramStrategy {
    program: Arc<Program>,
    registry: Arc<ProfileRegistry>,
}

impl ProgramStrategy {
    pub fn new(program: Arc<Program>, registry: Arc<ProfileRegistry>) -> Self {
        Self { program, registry }
    }

    fn name_of(&self, method: MethodId) -> String {
        self.program.method(method).map_or_else(|| method.to_string(), |m| m.to_string())
    }
}

impl RewriteStrategy for ProgramStrategy {
    fn resolve(&self, target: &PatchTarget) -> Option<MethodId> {
        self.program.resolve(target)
    }

    fn describe(&self, method: MethodId) -> Option<MethodRef> {
        self.program.method(method)
    }

    fn read_body(&self, method: MethodId) -> Result<Vec<Instruction>, RewriteError> {
        let body = self.program.body(method).ok_or_else(|| RewriteError::UnknownMethod(method.to_string()))?;
        body.instructions().map(<[Instruction]>::to_vec).ok_or_else(|| RewriteError::NoBody(self.name_of(method)))
    }

    fn define_replacement(&self, spec: &ReplacementSpec) -> Result<MethodId, RewriteError> {
        let registry = Arc::clone(&self.registry);
        let original = spec.original;
        let original_ref = spec.original_ref.clone();
        let kind = spec.kind;
        let signature = spec.signature.clone();
        let key = spec.key.clone();

        // The wrapper forwards the caller's argument slice untouched, so
        // pointer receivers and by-value arguments reach the original as-is.
        let body = MethodBody::native(move |program, args| {
            signature.check_args(args)?;
            let handle = registry.start(&key, || key.clone(), Some(MeasureSite::new(original, &original_ref)));
            let result = match kind {
                CallKind::Call => program.invoke(original, args),
                CallKind::CallVirt => program.invoke_virtual(original, args),
            };
            handle.stop();
            result
        });

        Ok(self.program.define_dynamic(spec.signature.as_method_ref(), body))
    }

    fn write_body(&self, method: MethodId, code: Vec<Instruction>) -> Result<(), RewriteError> {
        let current = self.program.body(method).ok_or_else(|| RewriteError::UnknownMethod(method.to_string()))?;
        let MethodBody::Il(il) = current.as_ref() else {
            return Err(RewriteError::NoBody(self.name_of(method)));
        };
        self.program
            .replace_body(method, MethodBody::il(il.locals, code))
            .map(|_| ())
            .map_err(|e| RewriteError::StrategyFailed(e.to_string()))
    }
}
