//! Group membership snapshot

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// One group in a membership snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub group_id: Uuid,
    pub is_admin_group: bool,
}

/// Immutable snapshot of an entity's transitive group membership.
///
/// The ordered list preserves discovery order (direct groups first); the id
/// set answers `in_group` without a scan. Snapshots are computed on demand
/// and cached per entity; they are never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMembership {
    groups: Vec<MembershipEntry>,
    ids: HashSet<Uuid>,
}

impl GroupMembership {
    pub fn new(groups: Vec<MembershipEntry>) -> Self {
        let ids = groups.iter().map(|g| g.group_id).collect();
        Self { groups, ids }
    }

    pub fn groups(&self) -> &[MembershipEntry] {
        &self.groups
    }

    pub fn group_ids(&self) -> &HashSet<Uuid> {
        &self.ids
    }

    pub fn in_group(&self, group_id: Uuid) -> bool {
        self.ids.contains(&group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Restrict the snapshot to admin groups, preserving order
    pub fn admin_only(&self) -> GroupMembership {
        GroupMembership::new(
            self.groups
                .iter()
                .filter(|g| g.is_admin_group)
                .copied()
                .collect(),
        )
    }
}
