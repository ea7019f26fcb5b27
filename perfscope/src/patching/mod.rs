//! Interception and the patch lifecycle
//!
//! - `interceptor`: hook pairs and the priority-ordered chain on one method
//! - `catalog`: patch specs and the registration table of profile modes
//! - `lifecycle`: the global apply/remove state machine

pub mod catalog;
pub mod interceptor;
pub mod lifecycle;

pub use catalog::{ModeCatalog, ModeSummary, PatchKind, PatchSpec, ProfileMode};
pub use interceptor::{CallSite, EntryHook, ExitHook, Flow, HookChain, HookState, Interceptor};
pub use lifecycle::{PatchDescriptor, PatchLifecycle, PatchReport};
