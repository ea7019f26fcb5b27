//! Replacement signatures for wrapped call sites
//!
//! A wrapper is always static, so the callee's receiver becomes an explicit
//! first parameter:
//!
//! | Callee                      | Wrapper parameters         |
//! |-----------------------------|----------------------------|
//! | static `T.M(a, b)`          | `(a, b)`                   |
//! | instance on reference `T`   | `(T, a, b)`                |
//! | instance on value type `T`  | `(ref T, a, b)`            |
//!
//! Value-type receivers stay by reference so the callee mutates the
//! caller's storage rather than a copy.

use perfscope_common::{MethodRef, ReceiverKind, DYNAMIC_OWNER, REPLACEMENT_SUFFIX};

use crate::domain::HostError;
use crate::host::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    pub type_name: String,
    pub by_ref: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementSignature {
    pub name: String,
    /// Declaring type of the wrapper; `None` when the callee is on an interface
    pub owner: Option<String>,
    pub params: Vec<ParamSlot>,
    pub returns_value: bool,
}

impl ReplacementSignature {
    #[must_use]
    pub fn for_callee(callee: &MethodRef) -> Self {
        let receiver = match callee.receiver {
            ReceiverKind::Static => None,
            ReceiverKind::Reference => Some(ParamSlot { type_name: callee.declaring_type.clone(), by_ref: false }),
            ReceiverKind::Value => Some(ParamSlot { type_name: callee.declaring_type.clone(), by_ref: true }),
        };
        let params = receiver
            .into_iter()
            .chain(callee.params.iter().map(|p| ParamSlot { type_name: p.clone(), by_ref: false }))
            .collect();

        Self {
            name: format!("{}{REPLACEMENT_SUFFIX}", callee.name),
            owner: (!callee.declaring_is_interface).then(|| callee.declaring_type.clone()),
            params,
            returns_value: callee.returns_value,
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Host description of the wrapper method.
    #[must_use]
    pub fn as_method_ref(&self) -> MethodRef {
        let owner = self.owner.as_deref().unwrap_or(DYNAMIC_OWNER);
        let mut method = MethodRef::new_static(owner, self.name.clone());
        for slot in &self.params {
            let type_name = if slot.by_ref { format!("ref {}", slot.type_name) } else { slot.type_name.clone() };
            method = method.param(type_name);
        }
        if self.returns_value {
            method = method.returning();
        }
        method
    }

    /// Check that by-reference slots receive managed pointers.
    pub fn check_args(&self, args: &[Value]) -> Result<(), HostError> {
        if args.len() != self.params.len() {
            return Err(HostError::ArityMismatch {
                method: self.name.clone(),
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        for (slot, arg) in self.params.iter().zip(args) {
            if slot.by_ref && !matches!(arg, Value::ByRef(_)) {
                return Err(HostError::TypeMismatch {
                    context: format!("{} receiver", self.name),
                    expected: format!("ref {}, got {}", slot.type_name, arg.kind()),
                });
            }
        }
        Ok(())
    }
}

/// Measurement key of a wrapped callee: `Declaring.Member`.
#[must_use]
pub fn measurement_key(callee: &MethodRef) -> String {
    format!("{}.{}", callee.declaring_type, callee.name)
}
