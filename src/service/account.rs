//! Account lifecycle and alias management
//!
//! Aliases are separate directory records pointing at a target entity's id.
//! A dangling alias (target gone) is repaired when a create or alias-add
//! collides with it; removal failures after the primary mutation are logged
//! and never roll the mutation back.

use crate::directory::{Filter, Modification, SearchOptions, SearchScope};
use crate::domain::{names, normalize_address, AccountKey, AttrMap, DomainKey, DomainType, Entity, EntityKind};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Input for creating an account or calendar resource
#[derive(Debug, Clone, Validate)]
pub struct CreateAccountInput {
    #[validate(email)]
    pub name: String,
    pub password: Option<String>,
    pub attrs: AttrMap,
    pub calendar_resource: bool,
}

impl CreateAccountInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            attrs: AttrMap::new(),
            calendar_resource: false,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

impl Provisioning {
    pub async fn create_account(&self, input: CreateAccountInput) -> Result<Arc<Entity>> {
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
        let kind = if input.calendar_resource {
            EntityKind::CalendarResource
        } else {
            EntityKind::Account
        };
        let mut classes = vec![
            "inetOrgPerson".to_string(),
            EntityKind::Account.object_class().to_string(),
        ];
        if input.calendar_resource {
            classes.push(EntityKind::CalendarResource.object_class().to_string());
        }
        attrs.set_multi(names::A_OBJECT_CLASS, classes);
        attrs.set(names::A_PROVIS_ID, Uuid::new_v4().to_string());
        attrs.set(names::A_UID, local);
        attrs.set(names::A_MAIL, &name);
        if attrs.get(names::A_ACCOUNT_STATUS).is_none() {
            attrs.set(names::A_ACCOUNT_STATUS, "active");
        }
        if let Some(password) = &input.password {
            let policy = crate::domain::PasswordPolicy::from_attrs(&domain.attrs);
            policy
                .validate_password(password)
                .map_err(|errors| AppError::PolicyViolation(errors.join("; ")))?;
            attrs.set(names::A_PASSWORD, crate::crypto::hash_password(password)?);
            attrs.set(
                names::A_PASSWORD_MODIFIED_TIME,
                Utc::now().format("%Y%m%d%H%M%SZ").to_string(),
            );
        }

        let dn = self.dit().address_dn(local, domain_name);
        self.store().add(&dn, attrs).await?;
        tracing::info!(%name, kind = kind.as_str(), "entity created");

        let entry = self
            .store()
            .get_by_dn(&dn)
            .await?
            .ok_or_else(|| AppError::not_found("account", &name))?;
        let entity = self.make_entity(entry, true).await?;
        self.cache_entity(&entity);
        Ok(entity)
    }

    pub async fn delete_account(&self, id: Uuid) -> Result<()> {
        let account = self
            .get_account(AccountKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("account", id.to_string()))?;

        // post-commit cleanups below are best-effort by design; the account
        // removal itself must not be rolled back once decided
        self.remove_alias_records(&account).await;
        self.remove_address_from_all_lists(&account.addresses()).await;

        self.store().delete(&account.dn).await?;
        self.evict_entity(&account);
        tracing::info!(name = %account.name, "account deleted");
        Ok(())
    }

    /// Add an alias to any address-bearing entity (account, calendar
    /// resource, or distribution list)
    pub async fn add_alias(&self, entity: &Arc<Entity>, alias: &str) -> Result<Arc<Entity>> {
        let alias = normalize_address(alias)?;
        let (alias_local, alias_domain) = alias.split_once('@').expect("normalized address");

        self.get_domain(DomainKey::Name(alias_domain.to_string()), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", alias_domain))?;

        self.reclaim_address(&alias).await?;

        let mut attrs = AttrMap::new();
        attrs.set(names::A_OBJECT_CLASS, EntityKind::Alias.object_class());
        attrs.set(names::A_PROVIS_ID, Uuid::new_v4().to_string());
        attrs.set(names::A_UID, alias_local);
        attrs.set(names::A_MAIL, &alias);
        attrs.set(names::A_ALIAS_TARGET_ID, entity.id.to_string());

        let alias_dn = self.dit().address_dn(alias_local, alias_domain);
        self.store().add(&alias_dn, attrs).await?;

        self.modify_attrs(
            entity,
            vec![Modification::Add(
                names::A_MAIL_ALIAS.to_string(),
                vec![alias.clone()],
            )],
        )
        .await
    }

    /// Remove an alias. A missing alias record is repaired rather than
    /// reported: the address attribute is cleaned up regardless.
    pub async fn remove_alias(&self, entity: &Arc<Entity>, alias: &str) -> Result<Arc<Entity>> {
        let alias = normalize_address(alias)?;
        let (alias_local, alias_domain) = alias.split_once('@').expect("normalized address");

        let alias_dn = self.dit().address_dn(alias_local, alias_domain);
        match self.store().get_by_dn(&alias_dn).await? {
            Some(record) => {
                let target = record.attrs.get(names::A_ALIAS_TARGET_ID);
                if target == Some(entity.id.to_string().as_str()) {
                    self.store().delete(&alias_dn).await?;
                } else {
                    tracing::warn!(%alias, ?target, "alias record points elsewhere, left in place");
                }
            }
            None => {
                tracing::warn!(%alias, "alias record already gone");
            }
        }

        self.modify_attrs(
            entity,
            vec![Modification::DeleteValues(
                names::A_MAIL_ALIAS.to_string(),
                vec![alias.clone()],
            )],
        )
        .await
    }

    /// Make an address available for a create: an existing entry under the
    /// address fails with `AlreadyExists`, unless it is a dangling alias
    /// (its target no longer resolves), which is removed and the address
    /// reclaimed.
    pub(crate) async fn reclaim_address(&self, address: &str) -> Result<()> {
        let filter = Filter::or(vec![
            Filter::eq(names::A_MAIL, address),
            Filter::eq(names::A_MAIL_ALIAS, address),
        ]);
        let existing = self
            .store()
            .search(
                self.dit().base_dn(),
                SearchScope::Subtree,
                &filter,
                &SearchOptions::master(),
            )
            .await?
            .entries;
        if existing.is_empty() {
            return Ok(());
        }

        // the address is reclaimable only if everything holding it is a
        // dangling alias record
        for entry in &existing {
            let is_alias =
                EntityKind::from_object_classes(entry.attrs.get_all(names::A_OBJECT_CLASS))
                    == Some(EntityKind::Alias);
            if !is_alias {
                return Err(AppError::AlreadyExists(address.to_string()));
            }
            let target = entry
                .attrs
                .get(names::A_ALIAS_TARGET_ID)
                .and_then(|raw| Uuid::parse_str(raw).ok());
            let dangling = match target {
                Some(target_id) => self
                    .get_account(AccountKey::Id(target_id), true)
                    .await?
                    .is_none(),
                None => true,
            };
            if !dangling {
                return Err(AppError::AlreadyExists(address.to_string()));
            }
        }
        for entry in existing {
            tracing::warn!(address, "removing dangling alias to reclaim address");
            self.store().delete(&entry.dn).await?;
        }
        Ok(())
    }

    /// Delete every alias record pointing at this entity. Failures are
    /// logged, not raised.
    pub(crate) async fn remove_alias_records(&self, entity: &Entity) {
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::Alias.object_class()),
            Filter::eq(names::A_ALIAS_TARGET_ID, entity.id.to_string()),
        ]);
        let records = match self
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
                tracing::warn!(%err, name = %entity.name, "alias cleanup search failed");
                return;
            }
        };
        for record in records {
            if let Err(err) = self.store().delete(&record.dn).await {
                tracing::warn!(%err, dn = %record.dn, "alias record cleanup failed");
            }
        }
    }

    /// Remove the given addresses from every distribution list referencing
    /// them. Failures are logged, not raised.
    pub(crate) async fn remove_address_from_all_lists(&self, addresses: &[String]) {
        if addresses.is_empty() {
            return;
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
                tracing::warn!(%err, "member cleanup search failed");
                return;
            }
        };

        for list in lists {
            let result = self
                .store()
                .modify(
                    &list.dn,
                    vec![Modification::DeleteValues(
                        names::A_LIST_MEMBER.to_string(),
                        addresses.to_vec(),
                    )],
                )
                .await;
            if let Err(err) = result {
                tracing::warn!(%err, dn = %list.dn, "member cleanup failed");
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
}
