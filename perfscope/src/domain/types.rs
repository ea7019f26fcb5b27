//! Domain types providing compile-time safety and self-documentation
//!
//! These wrappers keep patch targets, hook priorities and lifecycle states
//! from being confused with plain strings and integers.

use std::fmt;
use std::str::FromStr;

use perfscope_common::MethodRef;
use serde::Serialize;

use super::errors::PatchError;

/// Immutable identifier of an interceptable callable.
///
/// A target is resolved against the host's method table when a patch is
/// applied, so a target can name a member that does not exist (yet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatchTarget {
    declaring_type: String,
    member: String,
}

impl PatchTarget {
    pub fn new(declaring_type: impl Into<String>, member: impl Into<String>) -> Self {
        Self { declaring_type: declaring_type.into(), member: member.into() }
    }

    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Measurement key derived from declaring type and member name
    pub fn key(&self) -> String {
        format!("{}.{}", self.declaring_type, self.member)
    }
}

impl From<&MethodRef> for PatchTarget {
    fn from(method: &MethodRef) -> Self {
        Self::new(method.declaring_type.clone(), method.name.clone())
    }
}

/// Parses `Declaring.Member`, splitting at the last dot.
impl FromStr for PatchTarget {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((declaring, member)) if !declaring.is_empty() && !member.is_empty() => {
                Ok(Self::new(declaring, member))
            }
            _ => Err(PatchError::MalformedTarget(s.to_string())),
        }
    }
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring_type, self.member)
    }
}

/// Hook priority
///
/// Entry hooks run from the highest priority to the lowest, exit hooks in the
/// reverse order, so a high-priority interceptor encloses a low-priority one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(pub i32);

impl Priority {
    pub const LAST: Priority = Priority(0);
    pub const LOW: Priority = Priority(200);
    pub const NORMAL: Priority = Priority(400);
    pub const HIGH: Priority = Priority(600);
    pub const FIRST: Priority = Priority(800);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Global patch state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CurrentState {
    #[default]
    Uninitialised,
    Patching,
    Open,
    UnpatchingQueued,
    Unpatching,
}

impl CurrentState {
    /// Whether a patch request may start from this state
    #[must_use]
    pub fn can_patch(self) -> bool {
        matches!(self, Self::Open | Self::Uninitialised | Self::UnpatchingQueued)
    }

    /// Whether an unpatch request may be queued from this state
    #[must_use]
    pub fn can_cleanup(self) -> bool {
        matches!(self, Self::Uninitialised | Self::Open | Self::Patching)
    }
}

impl fmt::Display for CurrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialised => "uninitialised",
            Self::Patching => "patching",
            Self::Open => "open",
            Self::UnpatchingQueued => "unpatching-queued",
            Self::Unpatching => "unpatching",
        };
        f.write_str(name)
    }
}

/// Category a profile mode belongs to
///
/// Mirrors when the measured code runs in the host: per simulation tick, per
/// rendered frame, per GUI pass, or in a category added at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum UpdateMode {
    /// Settings and utilities; never patches anything
    Dead,
    Tick,
    Update,
    Gui,
    ModderAdded,
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dead => "Home",
            Self::Tick => "Tick",
            Self::Update => "Update",
            Self::Gui => "GUI",
            Self::ModderAdded => "Modder Added",
        };
        f.pad(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfscope_common::ReceiverKind;

    #[test]
    fn test_patch_target_key() {
        let target = PatchTarget::new("Verse.World", "Tick");
        assert_eq!(target.key(), "Verse.World.Tick");
        assert_eq!(target.to_string(), "Verse.World.Tick");
    }

    #[test]
    fn test_patch_target_from_method() {
        let method = MethodRef::new_instance("Pawn", "TickRare", ReceiverKind::Reference);
        let target = PatchTarget::from(&method);
        assert_eq!(target.declaring_type(), "Pawn");
        assert_eq!(target.member(), "TickRare");
    }

    #[test]
    fn test_patch_target_parse() {
        let target: PatchTarget = "Verse.World.Tick".parse().unwrap();
        assert_eq!(target.declaring_type(), "Verse.World");
        assert_eq!(target.member(), "Tick");
        assert!("Tick".parse::<PatchTarget>().is_err());
        assert!("World.".parse::<PatchTarget>().is_err());
    }

    #[test]
    fn test_can_patch_states() {
        assert!(CurrentState::Uninitialised.can_patch());
        assert!(CurrentState::Open.can_patch());
        assert!(CurrentState::UnpatchingQueued.can_patch());
        assert!(!CurrentState::Patching.can_patch());
        assert!(!CurrentState::Unpatching.can_patch());
    }

    #[test]
    fn test_can_cleanup_states() {
        assert!(CurrentState::Uninitialised.can_cleanup());
        assert!(CurrentState::Open.can_cleanup());
        assert!(CurrentState::Patching.can_cleanup());
        assert!(!CurrentState::UnpatchingQueued.can_cleanup());
        assert!(!CurrentState::Unpatching.can_cleanup());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::FIRST > Priority::HIGH);
        assert!(Priority::NORMAL > Priority::LAST);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }
}
