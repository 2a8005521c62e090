//! Multi-entity rename workflows
//!
//! The backing store has no multi-object transactions, so renames run as
//! sagas: an ordered list of steps, each idempotent or compensatable, with
//! step-level logging on failure. The new path is always created before the
//! old one is removed, so a failure mid-way leaves the old entry
//! authoritative. Cross-reference updates performed after the primary
//! mutation (addresses inside other groups, alias records) are best-effort:
//! their failures are logged, never raised, because the primary rename must
//! not be rolled back. Cache entries for the old identity are evicted
//! unconditionally after every attempt, successful or not.

use crate::directory::{dn, Filter, Modification, SearchOptions, SearchScope};
use crate::domain::{
    names, normalize_address, normalize_domain, replace_domain, AccountKey, AttrMap, DomainKey,
    DomainType, Entity, EntityKind, GroupKey,
};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress marker kept on the source domain while a domain rename runs,
/// so a crashed rename can resume at the phase it reached
const A_DOMAIN_RENAME_INFO: &str = "provisDomainRenameInfo";

/// Domain rename phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RenamePhase {
    RenameEntries,
    FixForeignAliases,
    FixForeignDlMembers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RenameInfo {
    destination: String,
    phase: RenamePhase,
}

impl Provisioning {
    pub async fn rename_account(&self, id: Uuid, new_address: &str) -> Result<Arc<Entity>> {
        let account = self
            .get_account(AccountKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("account", id.to_string()))?;
        self.rename_addressed_entity(account, new_address).await
    }

    pub async fn rename_distribution_list(
        &self,
        id: Uuid,
        new_address: &str,
    ) -> Result<Arc<Entity>> {
        let list = self
            .get_group(GroupKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("distribution list", id.to_string()))?;
        self.rename_addressed_entity(list, new_address).await
    }

    async fn rename_addressed_entity(
        &self,
        entity: Arc<Entity>,
        new_address: &str,
    ) -> Result<Arc<Entity>> {
        let result = self.rename_addressed_inner(&entity, new_address).await;
        // the old identity leaves every cache no matter how the attempt
        // went; only then may the renamed entity be cached, since both
        // share the id
        self.evict_entity(&entity);
        match &result {
            Ok(renamed) => {
                self.cache_entity(renamed);
                if renamed.kind.is_group() {
                    self.dl_addresses_add(&renamed.addresses());
                }
            }
            Err(_) if entity.kind.is_group() => {
                // the failed attempt left the list as it was; its addresses
                // must stay in the membership set
                self.dl_addresses_add(&entity.addresses());
            }
            Err(_) => {}
        }
        result
    }

    async fn rename_addressed_inner(
        &self,
        entity: &Arc<Entity>,
        new_address: &str,
    ) -> Result<Arc<Entity>> {
        let new_address = normalize_address(new_address)?;
        if new_address.eq_ignore_ascii_case(&entity.name) {
            return Ok(entity.clone());
        }
        let (new_local, new_domain_name) = new_address.split_once('@').expect("normalized");
        let old_domain_name = entity
            .domain_part()
            .ok_or_else(|| AppError::InvalidInput(format!("{} has no domain", entity.name)))?
            .to_string();

        let target_domain = self
            .get_domain(DomainKey::Name(new_domain_name.to_string()), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", new_domain_name))?;
        if target_domain.domain_type() != DomainType::Local {
            return Err(AppError::InvalidInput(format!(
                "domain {new_domain_name} does not host entries"
            )));
        }

        // aliases in the old domain follow the entity; foreign-domain
        // aliases stay as they are
        let old_aliases = entity.attrs.get_all(names::A_MAIL_ALIAS).to_vec();
        let alias_pairs: Vec<(String, String)> = old_aliases
            .iter()
            .map(|alias| {
                let rewritten = match alias.split_once('@') {
                    Some((_, domain)) if domain.eq_ignore_ascii_case(&old_domain_name) => {
                        replace_domain(alias, new_domain_name)?
                    }
                    _ => alias.clone(),
                };
                Ok((alias.clone(), rewritten))
            })
            .collect::<Result<_>>()?;

        // best-effort pre-check; a concurrent create can still win the race,
        // in which case the store surfaces the collision mid-saga
        let mut moved_addresses = vec![new_address.clone()];
        moved_addresses.extend(
            alias_pairs
                .iter()
                .filter(|(old, new)| !old.eq_ignore_ascii_case(new))
                .map(|(_, new)| new.clone()),
        );
        for address in &moved_addresses {
            let filter = Filter::or(vec![
                Filter::eq(names::A_MAIL, address.clone()),
                Filter::eq(names::A_MAIL_ALIAS, address.clone()),
            ]);
            let holders = self
                .store()
                .search(
                    self.dit().base_dn(),
                    SearchScope::Subtree,
                    &filter,
                    &SearchOptions::master(),
                )
                .await?
                .entries;
            for holder in holders {
                let holder_id = holder
                    .attrs
                    .get(names::A_PROVIS_ID)
                    .and_then(|raw| Uuid::parse_str(raw).ok());
                let holder_target = holder
                    .attrs
                    .get(names::A_ALIAS_TARGET_ID)
                    .and_then(|raw| Uuid::parse_str(raw).ok());
                if holder_id != Some(entity.id) && holder_target != Some(entity.id) {
                    return Err(AppError::AlreadyExists(address.clone()));
                }
            }
        }

        let new_aliases: Vec<String> = alias_pairs.iter().map(|(_, new)| new.clone()).collect();
        let new_dn = self.dit().address_dn(new_local, new_domain_name);
        let moving = !new_dn.eq_ignore_ascii_case(&entity.dn);

        if moving {
            // step 1: create the new path first, from the raw entry (the
            // cached entity carries inherited defaults that must not be
            // written back)
            let raw = self
                .store()
                .get_by_dn(&entity.dn)
                .await?
                .ok_or_else(|| AppError::not_found(entity.kind.as_str(), entity.dn.clone()))?;
            let mut attrs = raw.attrs;
            attrs.set(names::A_UID, new_local);
            attrs.set(names::A_MAIL, &new_address);
            attrs.set_multi(names::A_MAIL_ALIAS, new_aliases.clone());
            self.store().add(&new_dn, attrs).await?;

            // step 2: move subordinate entries under the new path
            let children = self
                .store()
                .search(
                    &entity.dn,
                    SearchScope::OneLevel,
                    &Filter::Present(names::A_OBJECT_CLASS.to_string()),
                    &SearchOptions::master(),
                )
                .await?;
            for child in children.entries {
                let child_dn = format!("{},{}", dn::rdn(&child.dn), new_dn);
                if let Err(err) = self.store().rename(&child.dn, &child_dn).await {
                    warn!(%err, from = %child.dn, "subordinate move failed; old entry left authoritative");
                    return Err(err);
                }
            }
        } else {
            // pure address change at the same path
            self.store()
                .modify(
                    &entity.dn,
                    vec![
                        Modification::Replace(
                            names::A_MAIL.to_string(),
                            vec![new_address.clone()],
                        ),
                        Modification::Replace(names::A_MAIL_ALIAS.to_string(), new_aliases.clone()),
                    ],
                )
                .await?;
        }

        // step 3: propagate the renamed addresses into every referencing
        // group (best-effort: the primary rename has already succeeded)
        let mut renamed_pairs = vec![(entity.name.clone(), new_address.clone())];
        renamed_pairs.extend(
            alias_pairs
                .iter()
                .filter(|(old, new)| !old.eq_ignore_ascii_case(new))
                .cloned(),
        );
        self.propagate_renamed_addresses(&renamed_pairs).await;

        // step 4: move each alias's own record to mirror the new target
        for (old_alias, new_alias) in &alias_pairs {
            self.move_alias_record(old_alias, new_alias).await;
        }

        if moving {
            // step 5: the old path goes last; on failure both entries
            // exist and the error surfaces to the caller
            self.store().delete(&entity.dn).await?;
        }

        let entry = self
            .store()
            .get_by_dn(&new_dn)
            .await?
            .ok_or_else(|| AppError::not_found(entity.kind.as_str(), new_dn.clone()))?;
        let renamed = self.make_entity(entry, true).await?;
        info!(from = %entity.name, to = %new_address, "rename complete");
        Ok(renamed)
    }

    /// Rewrite member addresses in every group referencing a renamed
    /// address. Failures are logged per group, never raised.
    pub(crate) async fn propagate_renamed_addresses(&self, pairs: &[(String, String)]) {
        if pairs.is_empty() {
            return;
        }
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::DistributionList.object_class()),
            Filter::or(
                pairs
                    .iter()
                    .map(|(old, _)| Filter::eq(names::A_LIST_MEMBER, old.clone()))
                    .collect(),
            ),
        ]);
        let lists = match self
            .store()
            .search(
                self.dit().base_dn(),
                SearchScope::Subtree,
                &filter,
                &SearchOptions::master(),
            )
            .await
        {
            Ok(page) => page.entries,
            Err(err) => {
                warn!(%err, "address propagation search failed");
                return;
            }
        };

        for list in lists {
            let mut mods = Vec::new();
            for (old, new) in pairs {
                if list.attrs.contains_value(names::A_LIST_MEMBER, old) {
                    mods.push(Modification::DeleteValues(
                        names::A_LIST_MEMBER.to_string(),
                        vec![old.clone()],
                    ));
                    mods.push(Modification::Add(
                        names::A_LIST_MEMBER.to_string(),
                        vec![new.clone()],
                    ));
                }
            }
            if mods.is_empty() {
                continue;
            }
            if let Err(err) = self.store().modify(&list.dn, mods).await {
                warn!(%err, dn = %list.dn, "address propagation failed for group");
            } else if let Some(id) = list
                .attrs
                .get(names::A_PROVIS_ID)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            {
                self.groups.remove_by_id(id);
                self.computed.invalidate(id);
            }
        }
        self.acl_groups.invalidate_all();
    }

    /// Move one alias record to its new address, best-effort
    async fn move_alias_record(&self, old_alias: &str, new_alias: &str) {
        let Some((old_local, old_domain)) = old_alias.split_once('@') else {
            return;
        };
        let Some((new_local, new_domain)) = new_alias.split_once('@') else {
            return;
        };
        let old_record_dn = self.dit().address_dn(old_local, old_domain);
        let new_record_dn = self.dit().address_dn(new_local, new_domain);

        if !old_record_dn.eq_ignore_ascii_case(&new_record_dn) {
            if let Err(err) = self.store().rename(&old_record_dn, &new_record_dn).await {
                warn!(%err, alias = old_alias, "alias record move failed");
                return;
            }
        }
        if old_alias != new_alias {
            let result = self
                .store()
                .modify(
                    &new_record_dn,
                    vec![Modification::Replace(
                        names::A_MAIL.to_string(),
                        vec![new_alias.to_string()],
                    )],
                )
                .await;
            if let Err(err) = result {
                warn!(%err, alias = new_alias, "alias record rewrite failed");
            }
        }
    }

    /// Rename a domain and migrate everything hosted under it.
    ///
    /// Exposed as a single workflow but not atomic: the design accepts
    /// partial completion with logging. Progress is recorded on the source
    /// domain so an interrupted rename re-entered with the same destination
    /// skips the phases that already completed. The domain keeps its id:
    /// the destination entry carries a temporary id until the source entry
    /// is gone, then takes over the original.
    pub async fn rename_domain(&self, id: Uuid, new_name: &str) -> Result<Arc<Entity>> {
        let old_domain = self
            .get_domain(DomainKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", id.to_string()))?;
        let new_name = normalize_domain(new_name)?;
        if new_name.eq_ignore_ascii_case(&old_domain.name) {
            return Ok(old_domain);
        }

        let starting_phase = match old_domain
            .attrs
            .get(A_DOMAIN_RENAME_INFO)
            .and_then(|raw| serde_json::from_str::<RenameInfo>(raw).ok())
        {
            Some(info) if info.destination == new_name => {
                info!(from = %old_domain.name, to = %new_name, phase = ?info.phase, "resuming domain rename");
                info.phase
            }
            Some(info) => {
                return Err(AppError::InvalidInput(format!(
                    "domain rename to {} already in progress",
                    info.destination
                )));
            }
            None => RenamePhase::RenameEntries,
        };

        let new_domain_dn = self.ensure_destination_domain(&old_domain, &new_name).await?;

        for phase in [
            RenamePhase::RenameEntries,
            RenamePhase::FixForeignAliases,
            RenamePhase::FixForeignDlMembers,
        ] {
            if phase < starting_phase {
                continue;
            }
            self.set_rename_phase(&old_domain, &new_name, phase).await?;
            match phase {
                RenamePhase::RenameEntries => {
                    self.migrate_domain_entries(&old_domain, &new_name).await;
                }
                RenamePhase::FixForeignAliases => {
                    self.migrate_leftover_aliases(&old_domain, &new_name).await;
                }
                RenamePhase::FixForeignDlMembers => {
                    self.rewrite_foreign_references(&old_domain.name, &new_name)
                        .await;
                }
            }
        }

        // retire the source entry, then let the destination take over the id
        let people_dn = self.dit().people_dn(&old_domain.dn);
        if self.store().get_by_dn(&people_dn).await?.is_some() {
            self.store().delete(&people_dn).await?;
        }
        self.store().delete(&old_domain.dn).await?;
        // provisId is immutable on the public modify path; the saga writes
        // it directly because this is the one legitimate transfer
        self.store()
            .modify(
                &new_domain_dn,
                vec![Modification::Replace(
                    names::A_PROVIS_ID.to_string(),
                    vec![old_domain.id.to_string()],
                )],
            )
            .await?;

        self.flush_cache(crate::service::CacheKind::All);
        info!(from = %old_domain.name, to = %new_name, "domain rename complete");

        self.get_domain(DomainKey::Name(new_name.clone()), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", new_name))
    }

    /// Create the destination domain if a previous attempt did not already
    async fn ensure_destination_domain(
        &self,
        old_domain: &Entity,
        new_name: &str,
    ) -> Result<String> {
        if let Some(existing) = self
            .get_domain(DomainKey::Name(new_name.to_string()), true)
            .await?
        {
            if old_domain
                .attrs
                .get(A_DOMAIN_RENAME_INFO)
                .is_some()
            {
                return Ok(existing.dn.clone());
            }
            return Err(AppError::AlreadyExists(new_name.to_string()));
        }

        let raw = self
            .store()
            .get_by_dn(&old_domain.dn)
            .await?
            .ok_or_else(|| AppError::not_found("domain", old_domain.dn.clone()))?;
        let mut attrs = raw.attrs;
        attrs.remove(names::A_DOMAIN_NAME);
        attrs.remove(names::A_OBJECT_CLASS);
        // create_domain stamps a fresh id; the destination keeps it only
        // until the source entry is deleted
        attrs.remove(names::A_PROVIS_ID);
        attrs.remove(A_DOMAIN_RENAME_INFO);

        let input = crate::service::domain::CreateDomainInput {
            name: new_name.to_string(),
            attrs,
        };
        let created = self.create_domain(input).await?;
        // the freshly cached destination carries the temporary id; drop it
        // so nothing resolves the domain until the rename completes
        self.domains.remove(&created);
        Ok(created.dn.clone())
    }

    async fn set_rename_phase(
        &self,
        old_domain: &Entity,
        destination: &str,
        phase: RenamePhase,
    ) -> Result<()> {
        let info = RenameInfo {
            destination: destination.to_string(),
            phase,
        };
        let raw = serde_json::to_string(&info)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("rename marker encoding: {e}")))?;
        self.store()
            .modify(
                &old_domain.dn,
                vec![Modification::Replace(
                    A_DOMAIN_RENAME_INFO.to_string(),
                    vec![raw],
                )],
            )
            .await?;
        self.domains.remove(old_domain);
        Ok(())
    }

    /// Move every entry hosted under the source domain to the destination,
    /// rewriting primary and same-domain alias addresses. Per-entry
    /// failures are logged and the migration continues.
    async fn migrate_domain_entries(&self, old_domain: &Entity, new_name: &str) {
        let people_dn = self.dit().people_dn(&old_domain.dn);
        let page = match self
            .store()
            .search(
                &people_dn,
                SearchScope::OneLevel,
                &Filter::Present(names::A_OBJECT_CLASS.to_string()),
                &SearchOptions::master(),
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, domain = %old_domain.name, "entry migration listing failed");
                return;
            }
        };

        for entry in page.entries {
            if let Err(err) = self
                .migrate_one_entry(&entry.dn, &entry.attrs, &old_domain.name, new_name)
                .await
            {
                warn!(%err, dn = %entry.dn, "entry migration failed, continuing");
            }
        }
    }

    async fn migrate_one_entry(
        &self,
        entry_dn: &str,
        attrs: &AttrMap,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let new_entry_dn = format!(
            "{},{}",
            dn::rdn(entry_dn),
            self.dit().people_dn(&self.dit().domain_dn(new_name))
        );
        self.store().rename(entry_dn, &new_entry_dn).await?;

        let mut mods = Vec::new();
        if let Some(mail) = attrs.get(names::A_MAIL) {
            if mail.to_lowercase().ends_with(&format!("@{old_name}")) {
                mods.push(Modification::Replace(
                    names::A_MAIL.to_string(),
                    vec![replace_domain(mail, new_name)?],
                ));
            }
        }
        let aliases = attrs.get_all(names::A_MAIL_ALIAS);
        if !aliases.is_empty() {
            let rewritten: Vec<String> = aliases
                .iter()
                .map(|alias| match alias.split_once('@') {
                    Some((_, domain)) if domain.eq_ignore_ascii_case(old_name) => {
                        replace_domain(alias, new_name)
                    }
                    _ => Ok(alias.clone()),
                })
                .collect::<Result<_>>()?;
            mods.push(Modification::Replace(
                names::A_MAIL_ALIAS.to_string(),
                rewritten,
            ));
        }
        if !mods.is_empty() {
            self.store().modify(&new_entry_dn, mods).await?;
        }
        Ok(())
    }

    /// Anything still sitting under the source domain after entry migration
    /// (typically alias records whose first move failed) gets a second
    /// chance here
    async fn migrate_leftover_aliases(&self, old_domain: &Entity, new_name: &str) {
        let people_dn = self.dit().people_dn(&old_domain.dn);
        let page = match self
            .store()
            .search(
                &people_dn,
                SearchScope::OneLevel,
                &Filter::object_class(EntityKind::Alias.object_class()),
                &SearchOptions::master(),
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(%err, domain = %old_domain.name, "leftover alias listing failed");
                return;
            }
        };

        for entry in page.entries {
            if let Err(err) = self
                .migrate_one_entry(&entry.dn, &entry.attrs, &old_domain.name, new_name)
                .await
            {
                warn!(%err, dn = %entry.dn, "leftover alias migration failed");
            }
        }
    }

    /// Rewrite references to the renamed domain held outside it: member
    /// addresses in every distribution list anywhere, and the messaging
    /// component registry
    async fn rewrite_foreign_references(&self, old_name: &str, new_name: &str) {
        let suffix = format!("@{old_name}");
        let lists = match self
            .store()
            .search(
                self.dit().base_dn(),
                SearchScope::Subtree,
                &Filter::object_class(EntityKind::DistributionList.object_class()),
                &SearchOptions::master(),
            )
            .await
        {
            Ok(page) => page.entries,
            Err(err) => {
                warn!(%err, "foreign member listing failed");
                return;
            }
        };
        for list in lists {
            let members = list.attrs.get_all(names::A_LIST_MEMBER);
            let stale: Vec<String> = members
                .iter()
                .filter(|m| m.to_lowercase().ends_with(&suffix))
                .cloned()
                .collect();
            if stale.is_empty() {
                continue;
            }
            let rewritten: Result<Vec<String>> = stale
                .iter()
                .map(|m| replace_domain(m, new_name))
                .collect();
            let rewritten = match rewritten {
                Ok(values) => values,
                Err(err) => {
                    warn!(%err, dn = %list.dn, "foreign member rewrite skipped");
                    continue;
                }
            };
            let result = self
                .store()
                .modify(
                    &list.dn,
                    vec![
                        Modification::DeleteValues(names::A_LIST_MEMBER.to_string(), stale),
                        Modification::Add(names::A_LIST_MEMBER.to_string(), rewritten),
                    ],
                )
                .await;
            if let Err(err) = result {
                warn!(%err, dn = %list.dn, "foreign member rewrite failed");
            }
        }

        let components = match self
            .store()
            .search(
                self.dit().base_dn(),
                SearchScope::Subtree,
                &Filter::and(vec![
                    Filter::object_class(EntityKind::XmppComponent.object_class()),
                    Filter::eq(names::A_COMPONENT_DOMAIN, old_name),
                ]),
                &SearchOptions::master(),
            )
            .await
        {
            Ok(page) => page.entries,
            Err(err) => {
                warn!(%err, "component registry listing failed");
                return;
            }
        };
        for component in components {
            let result = self
                .store()
                .modify(
                    &component.dn,
                    vec![Modification::Replace(
                        names::A_COMPONENT_DOMAIN.to_string(),
                        vec![new_name.to_string()],
                    )],
                )
                .await;
            if let Err(err) = result {
                warn!(%err, dn = %component.dn, "component registry rewrite failed");
            }
        }
    }
}
