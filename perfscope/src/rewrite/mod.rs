//! Call-site rewriting
//!
//! Wraps the calls inside a method body with timing, behind a
//! [`RewriteStrategy`] so the same rewriter can patch the live host or a
//! recording test double.

pub mod program_strategy;
pub mod rewriter;
pub mod signature;
pub mod strategy;
#[cfg(test)]
pub(crate) mod test_support;

pub use program_strategy::ProgramStrategy;
pub use rewriter::{CallRewriter, RewriteRecord, RewriteSummary};
pub use signature::{measurement_key, ParamSlot, ReplacementSignature};
pub use strategy::{RecordingStrategy, ReplacementSpec, RewriteRequest, RewriteStrategy};
