//! Patch specifications and profile modes
//!
//! A [`PatchSpec`] says what to do to one target: measure it, let a flag
//! suppress it, or install a caller-built interceptor. A [`ProfileMode`] is a
//! named set of specs the user switches between; the [`ModeCatalog`] holds the
//! built-in modes plus any created at runtime.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;

use super::interceptor::Interceptor;
use crate::domain::{PatchTarget, Priority, UpdateMode};

#[derive(Debug, Clone)]
pub enum PatchKind {
    /// Time every call under `key`
    Measure { key: String, label: Option<String> },
    /// Skip the original body while the flag is set
    KillSwitch(Arc<AtomicBool>),
    Custom(Interceptor),
}

#[derive(Debug, Clone)]
pub struct PatchSpec {
    pub target: PatchTarget,
    pub kind: PatchKind,
    pub priority: Priority,
    /// Also wrap every call site inside the target's body
    pub rewrite_internals: bool,
}

impl PatchSpec {
    /// Measure `target` under its default `Declaring.Member` key.
    pub fn measure(target: PatchTarget) -> Self {
        let key = target.key();
        Self {
            target,
            kind: PatchKind::Measure { key, label: None },
            priority: Priority::LAST,
            rewrite_internals: false,
        }
    }

    pub fn kill_switch(target: PatchTarget, flag: Arc<AtomicBool>) -> Self {
        Self { target, kind: PatchKind::KillSwitch(flag), priority: Priority::FIRST, rewrite_internals: false }
    }

    pub fn custom(target: PatchTarget, interceptor: Interceptor) -> Self {
        let priority = interceptor.priority;
        Self { target, kind: PatchKind::Custom(interceptor), priority, rewrite_internals: false }
    }

    /// Override the measurement key; no effect on other kinds.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        if let PatchKind::Measure { key: k, .. } = &mut self.kind {
            *k = key.into();
        }
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        if let PatchKind::Measure { label: l, .. } = &mut self.kind {
            *l = Some(label.into());
        }
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_internal_rewrite(mut self) -> Self {
        self.rewrite_internals = true;
        self
    }

    /// True when applying `other` would install the same patch as `self`.
    #[must_use]
    pub fn same_patch(&self, other: &PatchSpec) -> bool {
        let same_kind = match (&self.kind, &other.kind) {
            (PatchKind::Measure { key: a, label: la }, PatchKind::Measure { key: b, label: lb }) => a == b && la == lb,
            (PatchKind::KillSwitch(a), PatchKind::KillSwitch(b)) => Arc::ptr_eq(a, b),
            (PatchKind::Custom(a), PatchKind::Custom(b)) => a.same_hooks(b),
            _ => false,
        };
        same_kind
            && self.target == other.target
            && self.priority == other.priority
            && self.rewrite_internals == other.rewrite_internals
    }
}

/// Named set of patch specs.
#[derive(Debug, Clone)]
pub struct ProfileMode {
    pub name: String,
    pub mode: UpdateMode,
    pub specs: Vec<PatchSpec>,
    pub tip: String,
    /// Created at runtime rather than registered at startup
    pub dynamic: bool,
}

impl ProfileMode {
    pub fn new(name: impl Into<String>, mode: UpdateMode, specs: Vec<PatchSpec>) -> Self {
        Self { name: name.into(), mode, specs, tip: String::new(), dynamic: false }
    }

    #[must_use]
    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = tip.into();
        self
    }

    #[must_use]
    pub fn summary(&self) -> ModeSummary {
        ModeSummary {
            name: self.name.clone(),
            mode: self.mode,
            targets: self.specs.iter().map(|s| s.target.to_string()).collect(),
            tip: self.tip.clone(),
            dynamic: self.dynamic,
        }
    }
}

/// Serializable listing entry of a mode
#[derive(Debug, Clone, Serialize)]
pub struct ModeSummary {
    pub name: String,
    pub mode: UpdateMode,
    pub targets: Vec<String>,
    pub tip: String,
    pub dynamic: bool,
}

#[derive(Debug, Default)]
pub struct ModeCatalog {
    modes: BTreeMap<String, ProfileMode>,
}

impl ModeCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a mode by name.
    pub fn register(&mut self, mode: ProfileMode) {
        self.modes.insert(mode.name.clone(), mode);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProfileMode> {
        self.modes.get(name)
    }

    /// Modes of one category, sorted by name.
    pub fn by_mode(&self, mode: UpdateMode) -> impl Iterator<Item = &ProfileMode> {
        self.modes.values().filter(move |m| m.mode == mode)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProfileMode> {
        self.modes.values()
    }

    /// Create a runtime mode measuring `targets` in the frame-update category.
    pub fn make_mode(&mut self, name: &str, targets: &[PatchTarget]) -> &ProfileMode {
        let specs = targets.iter().cloned().map(PatchSpec::measure).collect();
        let mode = ProfileMode {
            name: name.to_string(),
            mode: UpdateMode::Update,
            specs,
            tip: "Created at runtime".to_string(),
            dynamic: true,
        };
        match self.modes.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(mode);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(mode),
        }
    }

    /// Remove a runtime mode; built-in modes are kept.
    pub fn remove_mode(&mut self, name: &str) -> Option<ProfileMode> {
        if self.modes.get(name).is_some_and(|m| m.dynamic) {
            self.modes.remove(name)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measure_spec_defaults() {
        let spec = PatchSpec::measure(PatchTarget::new("Verse.World", "Tick"));
        assert_eq!(spec.priority, Priority::LAST);
        assert!(!spec.rewrite_internals);
        match spec.kind {
            PatchKind::Measure { key, label } => {
                assert_eq!(key, "Verse.World.Tick");
                assert_eq!(label, None);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_builder_chain() {
        let spec = PatchSpec::measure(PatchTarget::new("A", "B"))
            .with_key("custom")
            .with_label("Nice name")
            .with_priority(Priority::HIGH)
            .with_internal_rewrite();
        assert!(spec.rewrite_internals);
        assert_eq!(spec.priority, Priority::HIGH);
        assert!(matches!(spec.kind, PatchKind::Measure { ref key, .. } if key == "custom"));
    }

    #[test]
    fn test_catalog_by_mode() {
        let mut catalog = ModeCatalog::new();
        catalog.register(ProfileMode::new("Pawns", UpdateMode::Tick, vec![]));
        catalog.register(ProfileMode::new("Music", UpdateMode::Update, vec![]));
        catalog.register(ProfileMode::new("Jobs", UpdateMode::Tick, vec![]));

        let tick: Vec<_> = catalog.by_mode(UpdateMode::Tick).map(|m| m.name.as_str()).collect();
        assert_eq!(tick, vec!["Jobs", "Pawns"]);
        assert_eq!(catalog.iter().count(), 3);
    }

    #[test]
    fn test_only_dynamic_modes_removable() {
        let mut catalog = ModeCatalog::new();
        catalog.register(ProfileMode::new("Builtin", UpdateMode::Tick, vec![]));
        let made = catalog.make_mode("Mine", &[PatchTarget::new("Rng", "Next")]);
        assert!(made.dynamic);
        assert_eq!(made.specs.len(), 1);

        assert!(catalog.remove_mode("Builtin").is_none());
        assert!(catalog.remove_mode("Mine").is_some());
        assert!(catalog.get("Mine").is_none());
    }
}
