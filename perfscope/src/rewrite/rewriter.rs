//! Call-site rewriter
//!
//! Instruments the calls *inside* a method body. Every call instruction is
//! pointed at a synthesized wrapper that measures the callee under its
//! `Declaring.Member` key and forwards the arguments unchanged:
//!
//! ```text
//!   before:  LdArg 0 │ CallVirt Pawn.TickRare │ Call Rng.Next
//!   after:   LdArg 0 │ Call TickRare_runtimeReplacement │ Call Next_runtimeReplacement
//! ```
//!
//! Instructions are replaced one-for-one, so branch targets stay valid.
//! Calls preceded by a `Constrained` prefix are left alone: the prefix
//! changes how the receiver is dispatched and only applies to the
//! instruction right after it.
//!
//! The original sequence is kept per method and written back verbatim on
//! removal. A method carries at most one rewrite.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use perfscope_common::{CallKind, Instruction, MethodId, MethodRef};

use super::signature::{measurement_key, ReplacementSignature};
use super::strategy::{ReplacementSpec, RewriteStrategy};
use crate::domain::{PatchTarget, RewriteError};

#[derive(Debug, Clone)]
pub struct RewriteRecord {
    pub original_target: MethodRef,
    pub original_instructions: Vec<Instruction>,
    /// (instruction index, wrapper) for every rewritten call
    pub replacements: Vec<(usize, MethodId)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RewriteSummary {
    pub wrapped: usize,
    /// Constrained call sites left untouched
    pub skipped: usize,
}

pub struct CallRewriter {
    strategy: Arc<dyn RewriteStrategy>,
    records: Mutex<HashMap<MethodId, RewriteRecord>>,
    key_methods: Mutex<HashMap<String, MethodId>>,
}

impl CallRewriter {
    pub fn new(strategy: Arc<dyn RewriteStrategy>) -> Self {
        Self { strategy, records: Mutex::new(HashMap::new()), key_methods: Mutex::new(HashMap::new()) }
    }

    pub fn install(&self, target: &PatchTarget) -> Result<RewriteSummary, RewriteError> {
        let id = self.strategy.resolve(target).ok_or_else(|| RewriteError::UnknownMethod(target.to_string()))?;
        self.install_method(id)
    }

    /// Rewrite every eligible call site in the body of `id`.
    pub fn install_method(&self, id: MethodId) -> Result<RewriteSummary, RewriteError> {
        // Held for the whole install so two installs on one method cannot interleave
        let mut records = self.records.lock();
        let original_target =
            self.strategy.describe(id).ok_or_else(|| RewriteError::UnknownMethod(id.to_string()))?;
        if records.contains_key(&id) {
            return Err(RewriteError::Conflict(original_target.to_string()));
        }

        let original = self.strategy.read_body(id)?;
        let mut rewritten = original.clone();
        let mut summary = RewriteSummary::default();
        let mut replacements = Vec::new();
        let mut wrappers: HashMap<(MethodId, CallKind), MethodId> = HashMap::new();
        let mut keys = Vec::new();

        for (index, instruction) in original.iter().enumerate() {
            let Some((callee, kind)) = instruction.call_target() else { continue };
            if index > 0 && original[index - 1].is_constrained_prefix() {
                summary.skipped += 1;
                continue;
            }

            let wrapper = match wrappers.get(&(callee, kind)) {
                Some(existing) => *existing,
                None => {
                    let callee_ref = self
                        .strategy
                        .describe(callee)
                        .ok_or_else(|| RewriteError::UnknownMethod(callee.to_string()))?;
                    let key = measurement_key(&callee_ref);
                    let spec = ReplacementSpec {
                        original: callee,
                        signature: ReplacementSignature::for_callee(&callee_ref),
                        original_ref: callee_ref,
                        kind,
                        key: key.clone(),
                    };
                    let wrapper = self.strategy.define_replacement(&spec)?;
                    wrappers.insert((callee, kind), wrapper);
                    keys.push((key, callee));
                    wrapper
                }
            };
            rewritten[index] = Instruction::Call(wrapper);
            replacements.push((index, wrapper));
            summary.wrapped += 1;
        }

        self.strategy.write_body(id, rewritten)?;
        self.key_methods.lock().extend(keys);
        records.insert(id, RewriteRecord { original_target: original_target.clone(), original_instructions: original, replacements });

        info!(
            "Rewrote {original_target}: {} call sites wrapped, {} constrained sites skipped",
            summary.wrapped, summary.skipped
        );
        Ok(summary)
    }

    /// Restore the original body of `target`.
    ///
    /// Returns `Ok(false)` when the target carries no rewrite.
    pub fn remove(&self, target: &PatchTarget) -> Result<bool, RewriteError> {
        match self.strategy.resolve(target) {
            Some(id) => self.remove_method(id),
            None => Ok(false),
        }
    }

    pub fn remove_method(&self, id: MethodId) -> Result<bool, RewriteError> {
        let mut records = self.records.lock();
        let Some(record) = records.remove(&id) else { return Ok(false) };
        if let Err(e) = self.strategy.write_body(id, record.original_instructions.clone()) {
            // Still rewritten, so keep the record for a later retry
            records.insert(id, record);
            return Err(e);
        }
        info!("Restored original body of {}", record.original_target);
        Ok(true)
    }

    /// Restore every rewritten method; returns how many were restored.
    pub fn remove_all(&self) -> usize {
        let ids: Vec<MethodId> = self.records.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| match self.remove_method(*id) {
                Ok(restored) => restored,
                Err(e) => {
                    warn!("Failed to restore {id}: {e}");
                    false
                }
            })
            .count()
    }

    #[must_use]
    pub fn is_rewritten(&self, id: MethodId) -> bool {
        self.records.lock().contains_key(&id)
    }

    #[must_use]
    pub fn is_target_rewritten(&self, target: &PatchTarget) -> bool {
        self.strategy.resolve(target).is_some_and(|id| self.is_rewritten(id))
    }

    #[must_use]
    pub fn record(&self, id: MethodId) -> Option<RewriteRecord> {
        self.records.lock().get(&id).cloned()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Method last wrapped under measurement key `key`
    #[must_use]
    pub fn method_for_key(&self, key: &str) -> Option<MethodId> {
        self.key_methods.lock().get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::strategy::{RecordingStrategy, RewriteRequest};
    use perfscope_common::ReceiverKind;

    const HOST: MethodId = MethodId(0);
    const NEXT: MethodId = MethodId(1);
    const DESCRIBE: MethodId = MethodId(2);
    const TICK: MethodId = MethodId(3);

    fn host_body() -> Vec<Instruction> {
        vec![
            Instruction::LdcI8(0),
            Instruction::LdcI8(10),
            Instruction::Call(NEXT),
            Instruction::Pop,
            Instruction::LdArg(0),
            Instruction::CallVirt(TICK),
            Instruction::LdLocA(0),
            Instruction::Constrained("Counter".into()),
            Instruction::CallVirt(DESCRIBE),
            Instruction::Pop,
            Instruction::LdcI8(1),
            Instruction::LdcI8(2),
            Instruction::Call(NEXT),
            Instruction::Ret,
        ]
    }

    fn strategy() -> Arc<RecordingStrategy> {
        Arc::new(
            RecordingStrategy::new()
                .with_method(HOST, MethodRef::new_static("World", "Tick").param("Pawn").returning(), Some(host_body()))
                .with_method(NEXT, MethodRef::new_static("Rng", "Next").param("Int").param("Int").returning(), None)
                .with_method(
                    DESCRIBE,
                    MethodRef::new_instance("Object", "Describe", ReceiverKind::Reference).returning(),
                    None,
                )
                .with_method(TICK, MethodRef::new_instance("Pawn", "TickRare", ReceiverKind::Reference), None),
        )
    }

    fn target() -> PatchTarget {
        PatchTarget::new("World", "Tick")
    }

    #[test]
    fn test_install_wraps_and_skips_constrained() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());

        let summary = rewriter.install(&target()).unwrap();
        assert_eq!(summary, RewriteSummary { wrapped: 3, skipped: 1 });

        let body = strategy.body(HOST).unwrap();
        assert_eq!(body[8], Instruction::CallVirt(DESCRIBE));
        assert!(matches!(body[2], Instruction::Call(id) if id.0 >= RecordingStrategy::FIRST_WRAPPER_ID));
        // Both Rng.Next sites share one wrapper
        assert_eq!(body[2], body[12]);
        assert_eq!(body.len(), host_body().len());
        assert_eq!(rewriter.method_for_key("Pawn.TickRare"), Some(TICK));
    }

    #[test]
    fn test_wrapper_keeps_call_kind() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());
        rewriter.install(&target()).unwrap();

        let defines: Vec<_> = strategy
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                RewriteRequest::Define { key, kind, .. } => Some((key, kind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            defines,
            vec![("Rng.Next".to_string(), CallKind::Call), ("Pawn.TickRare".to_string(), CallKind::CallVirt)]
        );
    }

    #[test]
    fn test_second_install_conflicts() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());
        rewriter.install(&target()).unwrap();
        let rewritten = strategy.body(HOST);

        let err = rewriter.install(&target()).unwrap_err();
        assert!(matches!(err, RewriteError::Conflict(_)));
        assert_eq!(strategy.body(HOST), rewritten);
    }

    #[test]
    fn test_remove_restores_verbatim() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());
        rewriter.install(&target()).unwrap();

        assert!(rewriter.remove(&target()).unwrap());
        assert_eq!(strategy.body(HOST), Some(host_body()));
        assert!(!rewriter.is_rewritten(HOST));
        assert_eq!(rewriter.active_count(), 0);
    }

    #[test]
    fn test_remove_never_applied_is_noop() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());
        assert!(!rewriter.remove(&target()).unwrap());
        assert!(!rewriter.remove(&PatchTarget::new("No", "Such")).unwrap());
        assert!(strategy.requests().is_empty());
    }

    #[test]
    fn test_failed_restore_keeps_record() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy.clone());
        rewriter.install(&target()).unwrap();

        strategy.fail_writes(true);
        assert!(rewriter.remove(&target()).is_err());
        assert!(rewriter.is_rewritten(HOST));

        strategy.fail_writes(false);
        assert_eq!(rewriter.remove_all(), 1);
        assert_eq!(strategy.body(HOST), Some(host_body()));
    }

    #[test]
    fn test_body_less_target_rejected() {
        let strategy = strategy();
        let rewriter = CallRewriter::new(strategy);
        let err = rewriter.install(&PatchTarget::new("Rng", "Next")).unwrap_err();
        assert!(matches!(err, RewriteError::NoBody(_)));
        assert_eq!(rewriter.active_count(), 0);
    }
}
