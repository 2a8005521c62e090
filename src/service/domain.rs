//! Domain lifecycle

use crate::directory::{Filter, SearchOptions, SearchScope};
use crate::domain::{names, normalize_domain, AttrMap, DomainKey, Entity, EntityKind};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use std::sync::Arc;
use uuid::Uuid;

/// Input for creating a domain
#[derive(Debug, Clone)]
pub struct CreateDomainInput {
    pub name: String,
    pub attrs: AttrMap,
}

impl CreateDomainInput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: AttrMap::new(),
        }
    }

    /// Mark the new domain as an alias of an existing one
    pub fn alias_of(mut self, target: Uuid) -> Self {
        self.attrs.set(names::A_DOMAIN_TYPE, "alias");
        self.attrs
            .set(names::A_DOMAIN_ALIAS_TARGET_ID, target.to_string());
        self
    }
}

impl Provisioning {
    pub async fn create_domain(&self, input: CreateDomainInput) -> Result<Arc<Entity>> {
        let name = normalize_domain(&input.name)?;
        if self
            .get_domain(DomainKey::Name(name.clone()), true)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyExists(name));
        }

        let domain_dn = self.dit().domain_dn(&name);
        self.create_parent_components(&domain_dn).await?;

        let mut attrs = input.attrs;
        attrs.set_multi(
            names::A_OBJECT_CLASS,
            vec![
                "dcObject".to_string(),
                "organization".to_string(),
                EntityKind::Domain.object_class().to_string(),
            ],
        );
        attrs.set(names::A_PROVIS_ID, Uuid::new_v4().to_string());
        attrs.set(names::A_DOMAIN_NAME, &name);
        if attrs.get(names::A_DOMAIN_TYPE).is_none() {
            attrs.set(names::A_DOMAIN_TYPE, "local");
        }
        attrs.set("o", &name);
        attrs.set("dc", name.split('.').next().unwrap_or(&name));

        self.store().add(&domain_dn, attrs).await?;

        // the container every hosted entry lives under
        let mut people = AttrMap::new();
        people.set(names::A_OBJECT_CLASS, "organizationalUnit");
        people.set("ou", "people");
        self.store()
            .add(&self.dit().people_dn(&domain_dn), people)
            .await?;

        tracing::info!(%name, "domain created");

        let entry = self
            .store()
            .get_by_dn(&domain_dn)
            .await?
            .ok_or_else(|| AppError::not_found("domain", &name))?;
        let domain = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
        self.negative_domains.remove(&DomainKey::Name(name));
        self.domains.put(domain.clone());
        Ok(domain)
    }

    /// Delete a domain. The domain must not host any entries.
    pub async fn delete_domain(&self, id: Uuid) -> Result<()> {
        let domain = self
            .get_domain(DomainKey::Id(id), true)
            .await?
            .ok_or_else(|| AppError::not_found("domain", id.to_string()))?;

        let people_dn = self.dit().people_dn(&domain.dn);
        let hosted = self
            .store()
            .search(
                &people_dn,
                SearchScope::OneLevel,
                &Filter::Present(names::A_OBJECT_CLASS.to_string()),
                &SearchOptions {
                    size_limit: 1,
                    read_from_master: true,
                    ..Default::default()
                },
            )
            .await?;
        if !hosted.entries.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "domain {} still hosts entries",
                domain.name
            )));
        }

        if self.store().get_by_dn(&people_dn).await?.is_some() {
            self.store().delete(&people_dn).await?;
        }
        self.store().delete(&domain.dn).await?;
        self.evict_entity(&domain);
        tracing::info!(name = %domain.name, "domain deleted");
        Ok(())
    }

    /// Ensure the dc components above a domain entry exist
    async fn create_parent_components(&self, domain_dn: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = crate::directory::dn::parent(domain_dn);
        while let Some(dn) = current {
            if dn.eq_ignore_ascii_case(self.dit().base_dn()) {
                break;
            }
            if self.store().get_by_dn(dn).await?.is_some() {
                break;
            }
            missing.push(dn.to_string());
            current = crate::directory::dn::parent(dn);
        }

        for dn in missing.into_iter().rev() {
            let rdn = crate::directory::dn::rdn(&dn);
            let label = rdn.split_once('=').map(|(_, v)| v).unwrap_or(rdn);
            let mut attrs = AttrMap::new();
            attrs.set(names::A_OBJECT_CLASS, "dcObject");
            attrs.set("dc", label);
            match self.store().add(&dn, attrs).await {
                Ok(()) | Err(AppError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
