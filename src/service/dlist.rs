//! Distribution list lifecycle and member management

use crate::directory::Modification;
use crate::domain::{names, normalize_address, AttrMap, DomainKey, DomainType, Entity, EntityKind, GroupKey};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Input for creating a distribution list
#[derive(Debug, Clone, Validate)]
pub struct CreateDistributionListInput {
    #[validate(email)]
    pub name: String,
    pub attrs: AttrMap,
}

impl CreateDistributionListInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: AttrMap::new(),
        }
    }
}

impl Provisioning {
    pub async fn create_distribution_list(
        &self,
        input: CreateDistributionListInput,
    ) -> Result<Arc<Entity>> {
        input.validate()?;
        let name = normalize_address(&input.name)?;
        let (local, domain_name) = name.split_once('@').expect("normalized address");

        let domain = self
            .get_domain(DomainKey::Name(domain_name.to_string()), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", domain_name))?;
        if domain.domain_type() != DomainType::Local {
            return Err(AppError::InvalidInput(format!(
                "domain {domain_name} does not host entries"
            )));
        }

        self.reclaim_address(&name).await?;

        let mut attrs = input.attrs;
        attrs.set(
            names::A_OBJECT_CLASS,
            EntityKind::DistributionList.object_class(),
        );
        attrs.set(names::A_PROVIS_ID, Uuid::new_v4().to_string());
        attrs.set(names::A_UID, local);
        attrs.set(names::A_MAIL, &name);

        let dn = self.dit().address_dn(local, domain_name);
        self.store().add(&dn, attrs).await?;
        tracing::info!(%name, "distribution list created");

        let entry = self
            .store()
            .get_by_dn(&dn)
            .await?
            .ok_or_else(|| AppError::not_found("distribution list", &name))?;
        let list = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
        self.groups.put(list.clone());
        self.dl_addresses_add(&list.addresses());
        Ok(list)
    }

    pub async fn delete_distribution_list(&self, id: Uuid) -> Result<()> {
        let list = self
            .get_group(GroupKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("distribution list", id.to_string()))?;

        self.remove_alias_records(&list).await;
        self.remove_address_from_all_lists(&list.addresses()).await;

        self.store().delete(&list.dn).await?;
        self.evict_entity(&list);
        tracing::info!(name = %list.name, "distribution list deleted");
        Ok(())
    }

    /// Add member addresses to a list. Members are addresses, not ids, so
    /// aliases are legal members.
    pub async fn add_group_members(
        &self,
        list: &Arc<Entity>,
        members: &[&str],
    ) -> Result<Arc<Entity>> {
        let members = normalize_members(members)?;
        let refreshed = self
            .modify_attrs(
                list,
                vec![Modification::Add(
                    names::A_LIST_MEMBER.to_string(),
                    members.clone(),
                )],
            )
            .await?;
        self.invalidate_member_caches(&members);
        Ok(refreshed)
    }

    pub async fn remove_group_members(
        &self,
        list: &Arc<Entity>,
        members: &[&str],
    ) -> Result<Arc<Entity>> {
        let members = normalize_members(members)?;
        let refreshed = self
            .modify_attrs(
                list,
                vec![Modification::DeleteValues(
                    names::A_LIST_MEMBER.to_string(),
                    members.clone(),
                )],
            )
            .await?;
        self.invalidate_member_caches(&members);
        Ok(refreshed)
    }

    /// Membership changed under these addresses: any cached member entity
    /// must recompute its group lists on next use
    fn invalidate_member_caches(&self, members: &[String]) {
        for member in members {
            if let Some(account) = self.accounts.get_by_name(member) {
                self.computed.invalidate(account.id);
            }
            if let Some(group) = self.groups.get_by_name(member) {
                self.computed.invalidate(group.id);
            }
        }
    }
}

fn normalize_members(members: &[&str]) -> Result<Vec<String>> {
    members.iter().map(|m| normalize_address(m)).collect()
}
