//! Structured error types for perfscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{CurrentState, PatchTarget};
use perfscope_common::MethodId;
use thiserror::Error;

/// Failure raised while executing a method body in the host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HostError {
    #[error("Unknown method {0}")]
    UnknownMethod(MethodId),

    #[error("Method {0} has no body")]
    AbstractMethod(String),

    #[error("{method} expects {expected} arguments, got {actual}")]
    ArityMismatch { method: String, expected: usize, actual: usize },

    #[error("Type mismatch in {context}: expected {expected}")]
    TypeMismatch { context: String, expected: String },

    #[error("Stack underflow in {0}")]
    StackUnderflow(String),

    #[error("Invalid local or argument slot {slot} in {method}")]
    InvalidSlot { method: String, slot: u16 },

    #[error("Null receiver in call to {0}")]
    NullReceiver(String),

    #[error("{0}")]
    Raised(String),
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("No member matches {0}")]
    MissingMember(PatchTarget),

    #[error("{0} has no body that can be intercepted")]
    UnsupportedShape(PatchTarget),

    #[error("{target} is already patched by {owner}")]
    AlreadyPatched { target: PatchTarget, owner: String },

    #[error("Patching {target} panicked: {message}")]
    Panicked { target: PatchTarget, message: String },

    #[error("Expected Declaring.Member, got {0:?}")]
    MalformedTarget(String),
}

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("{0} already has an active rewrite")]
    Conflict(String),

    #[error("No member matches {0}")]
    UnknownMethod(String),

    #[error("{0} has no instruction body")]
    NoBody(String),

    #[error("Rewrite strategy failed: {0}")]
    StrategyFailed(String),
}

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("No profiler registered for key {0}")]
    UnknownKey(String),

    #[error("Sample {index} of {key} is not finite")]
    NonFinite { key: String, index: usize },
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("A patch pass is already running (state: {0})")]
    Busy(CurrentState),

    #[error("No profile mode named {0}")]
    UnknownMode(String),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
