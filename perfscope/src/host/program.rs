//! Method table of the host program
//!
//! Every method lives in a [`MethodSlot`] holding two independently
//! swappable parts: the body that executes and the chain of interceptors
//! wrapped around it. Both are `Arc`s replaced whole under a short write
//! lock; the call path takes a read lock only long enough to clone them, so
//! a call that started before a swap finishes on the old version.
//!
//! Slots are append-only. Replacement methods synthesized by the call-site
//! rewriter stay in the table after a rewrite is removed, which keeps any
//! in-flight call through them valid.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use perfscope_common::{Instruction, MethodId, MethodRef};

use super::interp;
use super::value::Value;
use crate::domain::{HostError, PatchError, PatchTarget};
use crate::patching::{HookChain, Interceptor};

pub type NativeFn = Arc<dyn Fn(&Program, &mut [Value]) -> Result<Value, HostError> + Send + Sync>;

/// Instruction body with its local slot count.
#[derive(Debug, Clone, PartialEq)]
pub struct IlBody {
    pub locals: u16,
    pub code: Vec<Instruction>,
}

#[derive(Clone)]
pub enum MethodBody {
    Native(NativeFn),
    Il(Arc<IlBody>),
    /// Declared without a body (interface or abstract member)
    Abstract,
}

impl MethodBody {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&Program, &mut [Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        MethodBody::Native(Arc::new(f))
    }

    pub fn il(locals: u16, code: Vec<Instruction>) -> Self {
        MethodBody::Il(Arc::new(IlBody { locals, code }))
    }

    #[must_use]
    pub fn instructions(&self) -> Option<&[Instruction]> {
        match self {
            MethodBody::Il(body) => Some(&body.code),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_abstract(&self) -> bool {
        matches!(self, MethodBody::Abstract)
    }
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Native(_) => f.write_str("Native"),
            MethodBody::Il(body) => write!(f, "Il({} instructions)", body.code.len()),
            MethodBody::Abstract => f.write_str("Abstract"),
        }
    }
}

struct MethodSlot {
    method: MethodRef,
    body: RwLock<Arc<MethodBody>>,
    hooks: RwLock<Arc<HookChain>>,
}

#[derive(Default)]
pub struct Program {
    slots: RwLock<Vec<Arc<MethodSlot>>>,
    by_name: RwLock<HashMap<(String, String), MethodId>>,
    /// (base method, runtime type) -> overriding method
    overrides: RwLock<HashMap<(MethodId, String), MethodId>>,
}

impl Program {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method reachable by name through [`Program::resolve`].
    pub fn define(&self, method: MethodRef, body: MethodBody) -> MethodId {
        let key = (method.declaring_type.clone(), method.name.clone());
        let id = self.push_slot(method, body);
        self.by_name.write().insert(key, id);
        id
    }

    /// Add a method that is only reachable by id.
    pub fn define_dynamic(&self, method: MethodRef, body: MethodBody) -> MethodId {
        self.push_slot(method, body)
    }

    /// Route virtual calls of `base` on `runtime_type` receivers to `implementation`.
    pub fn define_override(&self, runtime_type: &str, base: MethodId, implementation: MethodId) {
        self.overrides.write().insert((base, runtime_type.to_string()), implementation);
    }

    fn push_slot(&self, method: MethodRef, body: MethodBody) -> MethodId {
        let mut slots = self.slots.write();
        #[allow(clippy::cast_possible_truncation)]
        let id = MethodId(slots.len() as u32);
        slots.push(Arc::new(MethodSlot {
            method,
            body: RwLock::new(Arc::new(body)),
            hooks: RwLock::new(Arc::new(HookChain::default())),
        }));
        id
    }

    fn slot(&self, id: MethodId) -> Option<Arc<MethodSlot>> {
        self.slots.read().get(id.0 as usize).cloned()
    }

    #[must_use]
    pub fn resolve(&self, target: &PatchTarget) -> Option<MethodId> {
        self.by_name
            .read()
            .get(&(target.declaring_type().to_string(), target.member().to_string()))
            .copied()
    }

    /// Method that a virtual call of `base` reaches for `runtime_type`.
    #[must_use]
    pub fn resolve_virtual(&self, base: MethodId, runtime_type: &str) -> MethodId {
        self.overrides.read().get(&(base, runtime_type.to_string())).copied().unwrap_or(base)
    }

    #[must_use]
    pub fn method(&self, id: MethodId) -> Option<MethodRef> {
        self.slot(id).map(|slot| slot.method.clone())
    }

    #[must_use]
    pub fn body(&self, id: MethodId) -> Option<Arc<MethodBody>> {
        self.slot(id).map(|slot| Arc::clone(&slot.body.read()))
    }

    /// Swap the body of `id`, returning the previous one.
    pub fn replace_body(&self, id: MethodId, body: MethodBody) -> Result<Arc<MethodBody>, HostError> {
        let slot = self.slot(id).ok_or(HostError::UnknownMethod(id))?;
        let mut current = slot.body.write();
        Ok(std::mem::replace(&mut *current, Arc::new(body)))
    }

    #[must_use]
    pub fn hooks(&self, id: MethodId) -> Option<Arc<HookChain>> {
        self.slot(id).map(|slot| Arc::clone(&slot.hooks.read()))
    }

    /// Add `interceptor` to the chain of `id`.
    pub fn install_interceptor(
        &self,
        id: MethodId,
        target: &PatchTarget,
        interceptor: Interceptor,
    ) -> Result<(), PatchError> {
        let slot = self.slot(id).ok_or_else(|| PatchError::MissingMember(target.clone()))?;
        let mut hooks = slot.hooks.write();
        let next = hooks.with(target, interceptor)?;
        *hooks = Arc::new(next);
        Ok(())
    }

    /// Drop every interceptor of `owner` from `id`; true if any was removed.
    pub fn remove_interceptors(&self, id: MethodId, owner: &str) -> bool {
        let Some(slot) = self.slot(id) else { return false };
        let mut hooks = slot.hooks.write();
        if !hooks.contains_owner(owner) {
            return false;
        }
        *hooks = Arc::new(hooks.without(owner));
        true
    }

    #[must_use]
    pub fn method_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Call `id` directly, running its interceptor chain.
    pub fn invoke(&self, id: MethodId, args: &mut [Value]) -> Result<Value, HostError> {
        let slot = self.slot(id).ok_or(HostError::UnknownMethod(id))?;
        let method = &slot.method;
        if args.len() != method.arity() {
            return Err(HostError::ArityMismatch {
                method: method.to_string(),
                expected: method.arity(),
                actual: args.len(),
            });
        }

        let hooks = Arc::clone(&slot.hooks.read());
        let body = Arc::clone(&slot.body.read());
        hooks.run(id, method, args, |args| self.execute(method, &body, args))
    }

    /// Call `id` dispatched on the runtime type of the receiver in `args[0]`.
    pub fn invoke_virtual(&self, id: MethodId, args: &mut [Value]) -> Result<Value, HostError> {
        let method = self.method(id).ok_or(HostError::UnknownMethod(id))?;
        if !method.receiver.has_receiver() {
            return self.invoke(id, args);
        }
        let receiver = args.first().ok_or_else(|| HostError::ArityMismatch {
            method: method.to_string(),
            expected: method.arity(),
            actual: 0,
        })?;
        let runtime_type = receiver.runtime_type().ok_or_else(|| HostError::NullReceiver(method.to_string()))?;
        self.invoke(self.resolve_virtual(id, &runtime_type), args)
    }

    fn execute(&self, method: &MethodRef, body: &MethodBody, args: &mut [Value]) -> Result<Value, HostError> {
        match body {
            MethodBody::Native(f) => f(self, args),
            MethodBody::Il(il) => interp::execute(self, method, il, args),
            MethodBody::Abstract => Err(HostError::AbstractMethod(method.to_string())),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("methods", &self.method_count()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::patching::Flow;
    use perfscope_common::ReceiverKind;

    fn add_program() -> (Program, MethodId) {
        let program = Program::new();
        let id = program.define(
            MethodRef::new_static("Math", "Add").param("Int").param("Int").returning(),
            MethodBody::native(|_, args| Ok(Value::Int(args[0].as_int()? + args[1].as_int()?))),
        );
        (program, id)
    }

    #[test]
    fn test_invoke_native() {
        let (program, id) = add_program();
        let result = program.invoke(id, &mut [Value::Int(2), Value::Int(3)]).unwrap();
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_arity_checked() {
        let (program, id) = add_program();
        let err = program.invoke(id, &mut [Value::Int(2)]).unwrap_err();
        assert!(matches!(err, HostError::ArityMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_resolve_by_name() {
        let (program, id) = add_program();
        assert_eq!(program.resolve(&PatchTarget::new("Math", "Add")), Some(id));
        assert_eq!(program.resolve(&PatchTarget::new("Math", "Sub")), None);
    }

    #[test]
    fn test_dynamic_methods_not_resolvable() {
        let program = Program::new();
        let id = program.define_dynamic(MethodRef::new_static("Gen", "Wrapper"), MethodBody::Abstract);
        assert!(program.method(id).is_some());
        assert_eq!(program.resolve(&PatchTarget::new("Gen", "Wrapper")), None);
    }

    #[test]
    fn test_interceptor_install_and_remove() {
        let (program, id) = add_program();
        let target = PatchTarget::new("Math", "Add");
        program
            .install_interceptor(
                id,
                &target,
                Interceptor::new("zero", Priority::NORMAL).on_entry(|_, _| Flow::SkipOriginal),
            )
            .unwrap();
        assert_eq!(program.invoke(id, &mut [Value::Int(1), Value::Int(1)]).unwrap(), Value::Unit);

        assert!(program.remove_interceptors(id, "zero"));
        assert!(!program.remove_interceptors(id, "zero"));
        assert_eq!(program.invoke(id, &mut [Value::Int(1), Value::Int(1)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_virtual_dispatch() {
        let program = Program::new();
        let base = program.define(
            MethodRef::new_instance("Pawn", "Name", ReceiverKind::Reference).returning(),
            MethodBody::native(|_, _| Ok(Value::str("pawn"))),
        );
        let colonist = program.define(
            MethodRef::new_instance("Colonist", "Name", ReceiverKind::Reference).returning(),
            MethodBody::native(|_, _| Ok(Value::str("colonist"))),
        );
        program.define_override("Colonist", base, colonist);

        let mut args = [Value::object("Colonist", vec![])];
        assert_eq!(program.invoke_virtual(base, &mut args).unwrap(), Value::str("colonist"));
        let mut args = [Value::object("Pawn", vec![])];
        assert_eq!(program.invoke_virtual(base, &mut args).unwrap(), Value::str("pawn"));
        let err = program.invoke_virtual(base, &mut [Value::Null]).unwrap_err();
        assert!(matches!(err, HostError::NullReceiver(_)));
    }

    #[test]
    fn test_replace_body_returns_previous() {
        let (program, id) = add_program();
        let old = program.replace_body(id, MethodBody::Abstract).unwrap();
        assert!(matches!(*old, MethodBody::Native(_)));
        assert!(program.invoke(id, &mut [Value::Int(1), Value::Int(1)]).is_err());
    }
}
