//! Permission & Metadata (component A): capability descriptors and the
//! closed permission set skills declare in their `SkillMetadata`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Closed set of capabilities a skill may declare. Declaring a permission
/// is not itself authorization to use it — the dispatcher may still refuse
/// to execute an action the caller's policy does not allow (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadConfig,
    SendMessages,
    SendDm,
    ReadProfile,
    WriteProfile,
    DeleteProfile,
    ReadSettings,
    WriteSettings,
    ManageUsers,
    ReadMetrics,
    TriggerHealing,
}

/// An immutable set of [`Permission`] values with set-algebra operations.
/// `BTreeSet` gives a stable, sorted iteration order for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_iter(perms: impl IntoIterator<Item = Permission>) -> Self {
        Self(perms.into_iter().collect())
    }

    pub fn has(&self, perm: Permission) -> bool {
        self.0.contains(&perm)
    }

    pub fn union(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet(self.0.union(&other.0).copied().collect())
    }

    /// True if every permission in `self` is also in `other`.
    pub fn subset_of(&self, other: &PermissionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[Permission; N]> for PermissionSet {
    fn from(value: [Permission; N]) -> Self {
        Self(value.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_reflects_membership() {
        let set = PermissionSet::from([Permission::ReadProfile, Permission::SendMessages]);
        assert!(set.has(Permission::ReadProfile));
        assert!(!set.has(Permission::DeleteProfile));
    }

    #[test]
    fn union_combines_both_sets() {
        let a = PermissionSet::from([Permission::ReadProfile]);
        let b = PermissionSet::from([Permission::SendMessages]);
        let u = a.union(&b);
        assert!(u.has(Permission::ReadProfile));
        assert!(u.has(Permission::SendMessages));
        assert_eq!(u.len(), 2);
    }

    #[test]
    fn subset_of_is_directional() {
        let small = PermissionSet::from([Permission::ReadProfile]);
        let big = PermissionSet::from([Permission::ReadProfile, Permission::WriteProfile]);
        assert!(small.subset_of(&big));
        assert!(!big.subset_of(&small));
    }

    #[test]
    fn empty_set_is_subset_of_everything() {
        let empty = PermissionSet::new();
        let any = PermissionSet::from([Permission::ManageUsers]);
        assert!(empty.subset_of(&any));
    }

    #[test]
    fn serde_roundtrip_is_sorted() {
        let set = PermissionSet::from([Permission::WriteProfile, Permission::ReadProfile]);
        let json = serde_json::to_string(&set).unwrap();
        let back: PermissionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }
}
