//! Key-based entity resolution
//!
//! The resolver turns a typed key into a cached entity: normalize the key,
//! consult the cache, fall back to an escaped directory search, construct
//! the typed entity with its inherited defaults, cache it, return it. Two
//! entries matching one key is a data-integrity fault and always surfaces
//! as [`AppError::MultipleMatched`].

use crate::directory::{DirEntry, Filter, SearchOptions, SearchScope};
use crate::domain::{
    names, replace_domain, AccountKey, DomainKey, DomainType, Entity, EntityKind, GroupKey,
};
use crate::error::{AppError, Result};
use crate::service::Provisioning;
use std::sync::Arc;
use uuid::Uuid;

/// Attributes that stay on the entity that owns them, never inherited from
/// a class of service or a domain
const NON_INHERITED: &[&str] = &[
    names::A_OBJECT_CLASS,
    "o",
    "ou",
    "dc",
    names::A_PROVIS_ID,
    names::A_UID,
    names::A_CN,
    names::A_MAIL,
    names::A_MAIL_ALIAS,
    names::A_LIST_MEMBER,
    names::A_ALIAS_TARGET_ID,
    names::A_ACCOUNT_STATUS,
    names::A_COS_ID,
    names::A_DOMAIN_NAME,
    names::A_DOMAIN_TYPE,
    names::A_DOMAIN_ALIAS_TARGET_ID,
    names::A_DOMAIN_DEFAULT_COS_ID,
    names::A_VIRTUAL_HOSTNAME,
    names::A_FOREIGN_NAME,
    names::A_FOREIGN_PRINCIPAL,
    names::A_KRB5_REALM,
    names::A_PASSWORD,
    names::A_PASSWORD_HISTORY,
    names::A_PASSWORD_MODIFIED_TIME,
    names::A_PASSWORD_MUST_CHANGE,
    names::A_PASSWORD_LOCKOUT_TIME,
    names::A_PASSWORD_FAILURE_TIME,
    names::A_AUTH_TOKEN_VALIDITY,
    names::A_MODIFIED_TIMESTAMP,
];

impl Provisioning {
    /// Resolve an account or calendar resource
    pub async fn get_account(
        &self,
        key: AccountKey,
        read_from_master: bool,
    ) -> Result<Option<Arc<Entity>>> {
        let key = key.normalized()?;

        let cached = match &key {
            AccountKey::Id(id) => self.accounts.get_by_id(*id),
            AccountKey::Name(name) | AccountKey::ForeignPrincipal(name) => {
                self.accounts.get_by_name(name)
            }
            AccountKey::Krb5Principal(principal) => {
                self.accounts.get_by_name(&format!("kerberos5:{principal}"))
            }
            AccountKey::AdminName(_) => None,
        };
        if let Some(entity) = cached {
            return Ok(Some(entity));
        }

        let filter = match &key {
            AccountKey::Id(id) => {
                account_kind_filter(Filter::eq(names::A_PROVIS_ID, id.to_string()))
            }
            AccountKey::Name(name) => {
                return self.get_account_by_address(name, read_from_master).await;
            }
            AccountKey::ForeignPrincipal(principal) => {
                account_kind_filter(Filter::eq(names::A_FOREIGN_PRINCIPAL, principal.clone()))
            }
            AccountKey::AdminName(name) => account_kind_filter(Filter::and(vec![
                Filter::eq(names::A_UID, name.clone()),
                Filter::eq(names::A_IS_ADMIN_ACCOUNT, "TRUE"),
            ])),
            AccountKey::Krb5Principal(principal) => account_kind_filter(Filter::eq(
                names::A_FOREIGN_PRINCIPAL,
                format!("kerberos5:{principal}"),
            )),
        };

        match self
            .search_unique(self.dit().base_dn(), &filter, read_from_master)
            .await?
        {
            Some(entry) => {
                let entity = self.make_entity(entry, true).await?;
                self.cache_entity(&entity);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Address lookup with the alias-domain fallback: when the direct
    /// lookup misses and the address's domain is an alias of another
    /// domain, retry with the target domain substituted in.
    async fn get_account_by_address(
        &self,
        address: &str,
        read_from_master: bool,
    ) -> Result<Option<Arc<Entity>>> {
        if let Some(entity) = self.lookup_by_address(address, read_from_master).await? {
            return Ok(Some(entity));
        }

        let Some((_, domain_name)) = address.split_once('@') else {
            return Ok(None);
        };
        let Some(domain) = self
            .get_domain(DomainKey::Name(domain_name.to_string()), read_from_master)
            .await?
        else {
            return Ok(None);
        };
        if domain.domain_type() != DomainType::Alias {
            return Ok(None);
        }
        let Some(target_id) = domain.alias_target_domain() else {
            return Ok(None);
        };
        let Some(target) = self
            .get_domain(DomainKey::Id(target_id), read_from_master)
            .await?
        else {
            return Ok(None);
        };

        let substituted = replace_domain(address, &target.name)?;
        self.lookup_by_address(&substituted, read_from_master).await
    }

    async fn lookup_by_address(
        &self,
        address: &str,
        read_from_master: bool,
    ) -> Result<Option<Arc<Entity>>> {
        if let Some(entity) = self.accounts.get_by_name(address) {
            return Ok(Some(entity));
        }
        let filter = account_kind_filter(address_filter(address));
        match self
            .search_unique(self.dit().base_dn(), &filter, read_from_master)
            .await?
        {
            Some(entry) => {
                let entity = self.make_entity(entry, true).await?;
                self.cache_entity(&entity);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Resolve a domain. Lookups by externally supplied keys (virtual
    /// hostname, foreign name, Kerberos realm) are negatively cached, so a
    /// repeated miss does not hit the directory again within the TTL.
    pub async fn get_domain(
        &self,
        key: DomainKey,
        read_from_master: bool,
    ) -> Result<Option<Arc<Entity>>> {
        let key = key.normalized()?;

        let cached = match &key {
            DomainKey::Id(id) => self.domains.get_by_id(*id),
            DomainKey::Name(name) => self.domains.get_by_name(name),
            DomainKey::VirtualHostname(value)
            | DomainKey::ForeignName(value)
            | DomainKey::Krb5Realm(value) => {
                if self.negative_domains.contains(&key) {
                    return Ok(None);
                }
                self.domains.get_by_name(value)
            }
        };
        if let Some(entity) = cached {
            return Ok(Some(entity));
        }

        let filter = match &key {
            DomainKey::Id(id) => Filter::eq(names::A_PROVIS_ID, id.to_string()),
            DomainKey::Name(name) => Filter::eq(names::A_DOMAIN_NAME, name.clone()),
            DomainKey::VirtualHostname(host) => Filter::eq(names::A_VIRTUAL_HOSTNAME, host.clone()),
            DomainKey::ForeignName(name) => Filter::eq(names::A_FOREIGN_NAME, name.clone()),
            DomainKey::Krb5Realm(realm) => Filter::eq(names::A_KRB5_REALM, realm.clone()),
        };
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::Domain.object_class()),
            filter,
        ]);

        match self
            .search_unique(self.dit().base_dn(), &filter, read_from_master)
            .await?
        {
            Some(entry) => {
                let entity = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
                self.negative_domains.remove(&key);
                self.domains.put(entity.clone());
                Ok(Some(entity))
            }
            None => {
                if matches!(
                    key,
                    DomainKey::VirtualHostname(_)
                        | DomainKey::ForeignName(_)
                        | DomainKey::Krb5Realm(_)
                ) {
                    self.negative_domains.put(key);
                }
                Ok(None)
            }
        }
    }

    /// Resolve a distribution list
    pub async fn get_group(
        &self,
        key: GroupKey,
        read_from_master: bool,
    ) -> Result<Option<Arc<Entity>>> {
        let (cached, filter) = match &key {
            GroupKey::Id(id) => (
                self.groups.get_by_id(*id),
                Filter::eq(names::A_PROVIS_ID, id.to_string()),
            ),
            GroupKey::Name(name) => {
                let name = crate::domain::normalize_address(name)?;
                (self.groups.get_by_name(&name), address_filter(&name))
            }
        };
        if let Some(entity) = cached {
            return Ok(Some(entity));
        }

        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::DistributionList.object_class()),
            filter,
        ]);
        match self
            .search_unique(self.dit().base_dn(), &filter, read_from_master)
            .await?
        {
            Some(entry) => {
                let entity = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
                self.groups.put(entity.clone());
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    pub async fn get_cos_by_id(&self, id: Uuid) -> Result<Option<Arc<Entity>>> {
        if let Some(entity) = self.cos.get_by_id(id) {
            return Ok(Some(entity));
        }
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::Cos.object_class()),
            Filter::eq(names::A_PROVIS_ID, id.to_string()),
        ]);
        self.fetch_cos(&filter).await
    }

    pub async fn get_cos_by_name(&self, name: &str) -> Result<Option<Arc<Entity>>> {
        let name = name.trim().to_lowercase();
        if let Some(entity) = self.cos.get_by_name(&name) {
            return Ok(Some(entity));
        }
        let filter = Filter::and(vec![
            Filter::object_class(EntityKind::Cos.object_class()),
            Filter::eq(names::A_CN, name),
        ]);
        self.fetch_cos(&filter).await
    }

    async fn fetch_cos(&self, filter: &Filter) -> Result<Option<Arc<Entity>>> {
        match self
            .search_unique(self.dit().base_dn(), filter, false)
            .await?
        {
            Some(entry) => {
                // transient representation: a class of service carries no
                // inherited defaults of its own
                let entity = Arc::new(Entity::from_entry(entry.dn, entry.attrs)?);
                self.cos.put(entity.clone());
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Search expecting at most one match; more than one is a directory
    /// integrity fault reported with the duplicate paths, never retried
    pub(crate) async fn search_unique(
        &self,
        base: &str,
        filter: &Filter,
        read_from_master: bool,
    ) -> Result<Option<DirEntry>> {
        let page = self
            .store()
            .search(
                base,
                SearchScope::Subtree,
                filter,
                &SearchOptions {
                    read_from_master,
                    ..Default::default()
                },
            )
            .await?;

        let mut entries = page.entries;
        match entries.len() {
            0 => Ok(None),
            1 => Ok(Some(entries.remove(0))),
            _ => Err(AppError::MultipleMatched {
                key: filter.to_string(),
                paths: entries.into_iter().map(|e| e.dn).collect(),
            }),
        }
    }

    /// Construct a typed entity from a directory entry.
    ///
    /// With `apply_defaults`, accounts inherit the attributes of their
    /// class of service (the account's own, or the domain default) and of
    /// their domain. Skipping defaults yields the transient representation
    /// used while resolving the class of service itself.
    pub(crate) async fn make_entity(
        &self,
        entry: DirEntry,
        apply_defaults: bool,
    ) -> Result<Arc<Entity>> {
        let mut entity = Entity::from_entry(entry.dn, entry.attrs)?;

        if apply_defaults && entity.kind.is_account() {
            let domain = match entity.domain_part() {
                Some(domain_name) => {
                    self.get_domain(DomainKey::Name(domain_name.to_string()), false)
                        .await?
                }
                None => None,
            };

            let cos_id = entity
                .attrs
                .get(names::A_COS_ID)
                .map(str::to_string)
                .or_else(|| {
                    domain.as_ref().and_then(|d| {
                        d.attrs
                            .get(names::A_DOMAIN_DEFAULT_COS_ID)
                            .map(str::to_string)
                    })
                });
            if let Some(cos_id) = cos_id.and_then(|raw| Uuid::parse_str(&raw).ok()) {
                if let Some(cos) = self.get_cos_by_id(cos_id).await? {
                    merge_inheritable(&mut entity, &cos);
                }
            }
            if let Some(domain) = &domain {
                merge_inheritable(&mut entity, domain);
            }
        }

        Ok(Arc::new(entity))
    }
}

fn account_kind_filter(filter: Filter) -> Filter {
    Filter::and(vec![
        Filter::or(vec![
            Filter::object_class(EntityKind::Account.object_class()),
            Filter::object_class(EntityKind::CalendarResource.object_class()),
        ]),
        filter,
    ])
}

/// Match an address against the primary address or any alias
fn address_filter(address: &str) -> Filter {
    Filter::or(vec![
        Filter::eq(names::A_MAIL, address),
        Filter::eq(names::A_MAIL_ALIAS, address),
    ])
}

fn merge_inheritable(entity: &mut Entity, source: &Entity) {
    let mut defaults = source.attrs.clone();
    for attr in NON_INHERITED {
        defaults.remove(attr);
    }
    entity.attrs.merge_defaults(&defaults);
}
