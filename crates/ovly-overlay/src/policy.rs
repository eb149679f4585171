//! Addition policy and the outcome of an addition attempt

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use ovly_dist::OwnerHandle;

/// Per-record override of the addition decision
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddPolicy(u8);

impl AddPolicy {
    pub const NONE: AddPolicy = AddPolicy(0);
    /// Reject unconditionally
    pub const FORCE_DENY: AddPolicy = AddPolicy(1);
    /// Never replace an existing version
    pub const DENY_REPLACE: AddPolicy = AddPolicy(1 << 1);
    /// Replace an existing version
    pub const FORCE_REPLACE: AddPolicy = AddPolicy(1 << 2);
    /// Only add if the version exists already
    pub const REPLACE_ONLY: AddPolicy = AddPolicy(1 << 3);
    /// Bump the revision instead of failing on a collision
    pub const REVBUMP_ON_COLLISION: AddPolicy = AddPolicy(1 << 4);

    const NAMES: [(AddPolicy, &'static str); 5] = [
        (Self::FORCE_DENY, "FORCE_DENY"),
        (Self::DENY_REPLACE, "DENY_REPLACE"),
        (Self::FORCE_REPLACE, "FORCE_REPLACE"),
        (Self::REPLACE_ONLY, "REPLACE_ONLY"),
        (Self::REVBUMP_ON_COLLISION, "REVBUMP_ON_COLLISION"),
    ];

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: AddPolicy) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    pub fn insert(&mut self, other: AddPolicy) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AddPolicy) {
        self.0 &= !other.0;
    }
}

impl BitOr for AddPolicy {
    type Output = AddPolicy;

    fn bitor(self, rhs: AddPolicy) -> AddPolicy {
        AddPolicy(self.0 | rhs.0)
    }
}

impl BitOrAssign for AddPolicy {
    fn bitor_assign(&mut self, rhs: AddPolicy) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AddPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join("|"))
    }
}

/// Why a record was not added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ForceDeny,
    DenyReplace,
    /// `REPLACE_ONLY` and nothing to replace
    NothingToReplace,
    /// Another package directory claims the distfile
    Collision,
    /// The same version is present and nothing changed
    AlreadyPresent,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::ForceDeny => "denied by policy",
            RejectReason::DenyReplace => "replacing denied by policy",
            RejectReason::NothingToReplace => "no version to replace",
            RejectReason::Collision => "distfile claimed by another package",
            RejectReason::AlreadyPresent => "version already present",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Added in place of an existing version
    Replaced,
    /// Decision postponed; retry later through the package directory handle
    Deferred(OwnerHandle),
    Rejected(RejectReason),
}

impl AddOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, AddOutcome::Added | AddOutcome::Replaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_operations() {
        let mut policy = AddPolicy::REPLACE_ONLY | AddPolicy::REVBUMP_ON_COLLISION;
        assert!(policy.contains(AddPolicy::REPLACE_ONLY));
        assert!(!policy.contains(AddPolicy::FORCE_DENY));
        assert!(!policy.contains(AddPolicy::NONE));

        policy.remove(AddPolicy::REPLACE_ONLY);
        assert_eq!(policy, AddPolicy::REVBUMP_ON_COLLISION);
        policy |= AddPolicy::FORCE_DENY;
        assert_eq!(format!("{:?}", policy), "FORCE_DENY|REVBUMP_ON_COLLISION");
        assert_eq!(format!("{:?}", AddPolicy::default()), "NONE");
    }

    #[test]
    fn test_outcome_is_added() {
        assert!(AddOutcome::Added.is_added());
        assert!(AddOutcome::Replaced.is_added());
        assert!(!AddOutcome::Rejected(RejectReason::AlreadyPresent).is_added());
    }
}
