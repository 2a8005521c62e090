//! Group membership engine
//!
//! Membership is stored on the group as a list of member addresses, so an
//! entity's direct groups are found by matching every address it owns
//! (primary and aliases) against the member lists. The transitive closure
//! walks a work stack with a visited set keyed by group id, which makes it
//! terminate on cyclic membership graphs; a "via" map records which
//! already-visited group introduced each newly discovered one, for
//! diagnostics.

use crate::cache::AclGroupEntry;
use crate::directory::{Filter, SearchOptions, SearchScope};
use crate::domain::{names, Entity, EntityKind, GroupKey, GroupMembership, MembershipEntry};
use crate::error::Result;
use crate::service::Provisioning;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

impl Provisioning {
    /// Groups the entity is a direct member of.
    ///
    /// The per-entity direct-group-id list is cached separately from the
    /// transitive result and verified lazily: an id whose group no longer
    /// resolves is dropped and the cached list rewritten.
    pub async fn direct_groups(&self, entity: &Arc<Entity>) -> Result<Vec<Arc<Entity>>> {
        let cached_ids = self
            .computed
            .get(entity.id)
            .and_then(|c| c.direct_group_ids);

        if let Some(ids) = cached_ids {
            let mut groups = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(group) = self.get_group(GroupKey::Id(*id), false).await? {
                    groups.push(group);
                }
            }
            if groups.len() != ids.len() {
                let fresh: Vec<Uuid> = groups.iter().map(|g| g.id).collect();
                self.computed
                    .update(entity.id, |c| c.direct_group_ids = Some(fresh));
            }
            return Ok(groups);
        }

        let groups = self.search_direct_groups(&entity.addresses()).await?;
        let ids: Vec<Uuid> = groups.iter().map(|g| g.id).collect();
        self.computed
            .update(entity.id, |c| c.direct_group_ids = Some(ids));
        Ok(groups)
    }

    async fn search_direct_groups(&self, addresses: &[String]) -> Result<Vec<Arc<Entity>>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::DistributionList.object_class()),
            Filter::or(
                addresses
                    .iter()
                    .map(|address| Filter::eq(names::A_LIST_MEMBER, address.clone()))
                    .collect(),
            ),
        ]);
        let page = self
            .store()
            .search(
                self.dit().base_dn(),
                SearchScope::Subtree,
                &filter,
                &SearchOptions::default(),
            )
            .await?;

        let mut groups = Vec::with_capacity(page.entries.len());
        for entry in page.entries {
            let group = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
            self.groups.put(group.clone());
            groups.push(group);
        }
        Ok(groups)
    }

    /// Direct and (unless `direct_only`) transitive groups, plus the via
    /// map: for each group found beyond the direct set, the id of the
    /// group that introduced it
    pub async fn all_groups(
        &self,
        entity: &Arc<Entity>,
        direct_only: bool,
    ) -> Result<(Vec<Arc<Entity>>, HashMap<Uuid, Uuid>)> {
        let direct = self.direct_groups(entity).await?;
        let mut result = Vec::new();
        let mut via = HashMap::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        // seed reversed so results come out direct-groups-first
        let mut stack: Vec<Arc<Entity>> = direct.iter().rev().cloned().collect();

        while let Some(group) = stack.pop() {
            if !visited.insert(group.id) {
                continue;
            }
            result.push(group.clone());
            if direct_only {
                continue;
            }
            for parent in self.direct_groups(&group).await? {
                if !visited.contains(&parent.id) {
                    via.entry(parent.id).or_insert(group.id);
                    stack.push(parent);
                }
            }
        }
        Ok((result, via))
    }

    /// Immutable membership snapshot, cached per entity in both the full
    /// and admin-only variants
    pub async fn group_membership(
        &self,
        entity: &Arc<Entity>,
        admin_only: bool,
    ) -> Result<Arc<GroupMembership>> {
        if let Some(computed) = self.computed.get(entity.id) {
            let cached = if admin_only {
                computed.admin_membership
            } else {
                computed.membership
            };
            if let Some(snapshot) = cached {
                return Ok(snapshot);
            }
        }

        let (groups, _via) = self.all_groups(entity, false).await?;
        let snapshot = Arc::new(GroupMembership::new(
            groups
                .iter()
                .map(|g| MembershipEntry {
                    group_id: g.id,
                    is_admin_group: g.is_admin_group(),
                })
                .collect(),
        ));
        let admin = Arc::new(snapshot.admin_only());

        let (full_clone, admin_clone) = (snapshot.clone(), admin.clone());
        self.computed.update(entity.id, |c| {
            c.membership = Some(full_clone);
            c.admin_membership = Some(admin_clone);
        });

        Ok(if admin_only { admin } else { snapshot })
    }

    /// Load a group for authorization: its upward membership is computed
    /// once, the member list is trimmed off, and the result goes into the
    /// bounded access-control cache so ordinary group traffic cannot evict
    /// it
    pub async fn acl_group(&self, id: Uuid) -> Result<Option<AclGroupEntry>> {
        if let Some(entry) = self.acl_groups.get(id) {
            return Ok(Some(entry));
        }
        let Some(group) = self.get_group(GroupKey::Id(id), false).await? else {
            return Ok(None);
        };
        let membership = self.group_membership(&group, false).await?;
        let entry = AclGroupEntry {
            group: Arc::new(group.without_members()),
            membership,
        };
        self.acl_groups.put(entry.clone());
        Ok(Some(entry))
    }
}
