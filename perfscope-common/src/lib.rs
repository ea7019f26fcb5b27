//! # Shared Instruction Model (Host ↔ Instrumentation)
//!
//! Defines the method and instruction types shared between the host program
//! (which executes method bodies) and the instrumentation engine (which
//! intercepts methods and rewrites their call sites). Keeping them in one
//! dependency-free crate means a host can be built against this crate alone.
//!
//! ## Key Types
//!
//! - [`MethodId`] - Handle of a method slot in the host's method table
//! - [`MethodRef`] - Immutable description of a callable (owner, name, shape)
//! - [`ReceiverKind`] - Static, reference-type instance, or value-type instance
//! - [`Instruction`] - One instruction of a method body
//! - [`CallKind`] - Direct or virtual dispatch of a call site

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

// ============================================================================
// Engine Constants
// ============================================================================

/// Default number of samples kept per profiler before the oldest is evicted.
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// Default sampling interval for the log refresh, in milliseconds.
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 500;

/// Number of standard deviations above the mean that marks a spike.
pub const OUTLIER_SIGMA: f64 = 2.0;

/// Key of the pseudo-log that summarises the whole active mode.
pub const OVERVIEW_KEY: &str = "Overview";

/// Suffix appended to the member name of a synthesized call-site wrapper.
pub const REPLACEMENT_SUFFIX: &str = "_runtimeReplacement";

/// Declaring type reported for wrappers whose callee lives on an interface.
pub const DYNAMIC_OWNER: &str = "<dynamic>";

// ============================================================================
// Method Identity
// ============================================================================

/// Handle of a method slot in the host's method table.
///
/// Handles are never reused, so a handle held by a rewritten call site stays
/// valid after the rewrite is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M#{}", self.0)
    }
}

/// How a method receives its instance, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverKind {
    /// No receiver
    Static,
    /// Receiver is a shared reference-type object
    Reference,
    /// Receiver is a value-type struct, passed as a managed pointer
    Value,
}

impl ReceiverKind {
    /// Returns true if the method takes an implicit receiver argument.
    #[must_use]
    pub fn has_receiver(self) -> bool {
        !matches!(self, ReceiverKind::Static)
    }
}

/// Immutable description of a callable in the host program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Fully qualified declaring type (e.g. `Verse.World`)
    pub declaring_type: String,
    /// Member name (e.g. `Tick`)
    pub name: String,
    /// Receiver shape
    pub receiver: ReceiverKind,
    /// Parameter type names, excluding the receiver
    pub params: Vec<String>,
    /// Whether a call leaves a value on the caller's stack
    pub returns_value: bool,
    /// Whether the declaring type is an interface
    pub declaring_is_interface: bool,
}

impl MethodRef {
    /// Describe a static method.
    pub fn new_static(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            receiver: ReceiverKind::Static,
            params: Vec::new(),
            returns_value: false,
            declaring_is_interface: false,
        }
    }

    /// Describe an instance method with the given receiver shape.
    pub fn new_instance(
        declaring_type: impl Into<String>,
        name: impl Into<String>,
        receiver: ReceiverKind,
    ) -> Self {
        Self { receiver, ..Self::new_static(declaring_type, name) }
    }

    /// Append a parameter type.
    #[must_use]
    pub fn param(mut self, type_name: impl Into<String>) -> Self {
        self.params.push(type_name.into());
        self
    }

    /// Mark the method as returning a value.
    #[must_use]
    pub fn returning(mut self) -> Self {
        self.returns_value = true;
        self
    }

    /// Mark the declaring type as an interface.
    #[must_use]
    pub fn on_interface(mut self) -> Self {
        self.declaring_is_interface = true;
        self
    }

    /// Number of stack arguments a call consumes, receiver included.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params.len() + usize::from(self.receiver.has_receiver())
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring_type, self.name)
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// Dispatch style of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Direct call of the named method
    Call,
    /// Virtual call, resolved against the receiver's runtime type
    CallVirt,
}

/// One instruction of a method body.
///
/// Branch operands are absolute instruction indices. Call-site rewriting
/// replaces instructions one-for-one, so branch targets survive a rewrite.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    /// Push an integer constant
    LdcI8(i64),
    /// Push a float constant
    LdcR8(f64),
    /// Push a string constant
    LdStr(String),
    /// Push null
    LdNull,
    /// Push argument `n`
    LdArg(u16),
    /// Pop into argument `n`
    StArg(u16),
    /// Push local `n` (value types are copied)
    LdLoc(u16),
    /// Pop into local `n`
    StLoc(u16),
    /// Push a managed pointer to local `n`
    LdLocA(u16),
    /// Push a zeroed value-type struct with `fields` integer fields
    NewStruct { type_name: String, fields: u16 },
    /// Pop an object, struct or pointer and push field `n`
    LdFld(u16),
    /// Pop a value and a target, store the value into field `n` of the target
    StFld(u16),
    Add,
    Sub,
    Mul,
    /// Pop b, a; push `a < b`
    Clt,
    /// Pop b, a; push `a == b`
    Ceq,
    Dup,
    Pop,
    Br(u32),
    BrTrue(u32),
    BrFalse(u32),
    /// Direct call
    Call(MethodId),
    /// Virtual call
    CallVirt(MethodId),
    /// Prefix: the following `CallVirt` dispatches on a pointer to this type
    Constrained(String),
    Ret,
}

impl Instruction {
    /// Returns true for instructions that invoke another method.
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self, Instruction::Call(_) | Instruction::CallVirt(_))
    }

    /// Callee and dispatch kind of a call instruction.
    #[must_use]
    pub fn call_target(&self) -> Option<(MethodId, CallKind)> {
        match self {
            Instruction::Call(id) => Some((*id, CallKind::Call)),
            Instruction::CallVirt(id) => Some((*id, CallKind::CallVirt)),
            _ => None,
        }
    }

    /// Returns true for the constrained-dispatch prefix.
    #[must_use]
    pub fn is_constrained_prefix(&self) -> bool {
        matches!(self, Instruction::Constrained(_))
    }
}
