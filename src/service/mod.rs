//! The provisioning engine
//!
//! [`Provisioning`] is the shared, thread-safe service object every request
//! handler goes through. It owns the entity caches, the directory store,
//! and the external-directory connector; the per-concern operations live in
//! the submodules ([`resolver`], [`groups`], [`rename`], [`auth`], [`gal`],
//! plus the entity lifecycle in [`account`], [`dlist`], and [`domain`]).
//!
//! The engine is constructed once per process. `init` installs the
//! process-wide instance and fails on a second call; `new` builds a
//! detached engine for embedding and tests.

pub mod account;
pub mod auth;
pub mod dlist;
pub mod domain;
pub mod gal;
pub mod groups;
pub mod rename;
pub mod resolver;

pub use auth::AuthMechanism;
pub use gal::{GalMode, GalResult, GalSearchParams, GalType};

use crate::cache::{AclGroupCache, CacheStats, ComputeCache, EntityCache, NegativeCache};
use crate::config::Config;
use crate::directory::{
    AttrSchema, DirectoryStore, Dit, ExternalDirectory, Filter, Modification, SearchOptions,
    SearchScope,
};
use crate::domain::{names, Entity, EntityKind};
use crate::error::{AppError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::info;

static GLOBAL: OnceLock<Arc<Provisioning>> = OnceLock::new();

/// Cache families addressable by [`Provisioning::flush_cache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Account,
    Domain,
    Group,
    Cos,
    AclGroup,
    GlobalConfig,
    All,
}

/// Per-cache counters for health introspection
#[derive(Debug, Clone, Copy)]
pub struct EngineCacheStats {
    pub accounts: CacheStats,
    pub domains: CacheStats,
    pub groups: CacheStats,
    pub cos: CacheStats,
    pub acl_groups: CacheStats,
}

/// Options for a generic directory listing
#[derive(Default)]
pub struct SearchDirectoryOptions {
    /// Restrict to one domain's subtree; None searches everything
    pub domain: Option<String>,
    /// Entity kinds to return; empty means every address-bearing kind
    pub kinds: Vec<EntityKind>,
    /// Additional filter, ANDed with the kind filter
    pub filter: Option<Filter>,
    /// Result cap; 0 is unlimited
    pub max_results: usize,
    pub read_from_master: bool,
}

/// The directory-backed identity and policy engine
pub struct Provisioning {
    config: Config,
    dit: Dit,
    store: Arc<dyn DirectoryStore>,
    external: Arc<dyn ExternalDirectory>,
    schema: Arc<dyn AttrSchema>,

    pub(crate) accounts: EntityCache,
    pub(crate) domains: EntityCache,
    pub(crate) groups: EntityCache,
    pub(crate) cos: EntityCache,
    pub(crate) negative_domains: NegativeCache,
    pub(crate) computed: ComputeCache,
    pub(crate) acl_groups: AclGroupCache,

    // lazily built, refreshed only by explicit flush
    global_config: Mutex<Option<Arc<crate::domain::AttrMap>>>,
    global_grant: Mutex<Option<Arc<crate::domain::AttrMap>>>,
    // every distribution list address, for cheap membership tests
    dl_addresses: RwLock<Option<HashSet<String>>>,
}

impl Provisioning {
    /// Build a detached engine. Servers should use [`init`](Self::init);
    /// this constructor exists for tests and embedding.
    pub fn new(
        config: Config,
        store: Arc<dyn DirectoryStore>,
        external: Arc<dyn ExternalDirectory>,
        schema: Arc<dyn AttrSchema>,
        base_dn: impl Into<String>,
    ) -> Arc<Self> {
        let cache = &config.cache;
        Arc::new(Self {
            dit: Dit::new(base_dn),
            accounts: EntityCache::new(cache.account_max_entries, cache.account_max_age),
            domains: EntityCache::new(cache.domain_max_entries, cache.domain_max_age),
            groups: EntityCache::new(cache.group_max_entries, cache.group_max_age),
            cos: EntityCache::new(cache.cos_max_entries, cache.cos_max_age),
            negative_domains: NegativeCache::new(cache.domain_max_entries, cache.negative_ttl),
            computed: ComputeCache::new(),
            acl_groups: AclGroupCache::new(cache.acl_group_max_entries, cache.acl_group_max_age),
            global_config: Mutex::new(None),
            global_grant: Mutex::new(None),
            dl_addresses: RwLock::new(None),
            config,
            store,
            external,
            schema,
        })
    }

    /// Construct and install the process-wide engine.
    ///
    /// A second construction is a startup error, surfaced to the caller
    /// rather than halting the process.
    pub fn init(
        config: Config,
        store: Arc<dyn DirectoryStore>,
        external: Arc<dyn ExternalDirectory>,
        schema: Arc<dyn AttrSchema>,
        base_dn: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let engine = Self::new(config, store, external, schema, base_dn);
        GLOBAL
            .set(engine.clone())
            .map_err(|_| AppError::Internal(anyhow::anyhow!("provisioning engine already constructed")))?;
        info!("provisioning engine initialized");
        Ok(engine)
    }

    /// The installed process-wide engine, if any
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn dit(&self) -> &Dit {
        &self.dit
    }

    pub(crate) fn store(&self) -> &dyn DirectoryStore {
        self.store.as_ref()
    }

    pub(crate) fn external(&self) -> &dyn ExternalDirectory {
        self.external.as_ref()
    }

    // ==================== Cache plumbing ====================

    pub(crate) fn cache_for(&self, kind: EntityKind) -> Option<&EntityCache> {
        match kind {
            EntityKind::Account | EntityKind::CalendarResource => Some(&self.accounts),
            EntityKind::Domain => Some(&self.domains),
            EntityKind::DistributionList => Some(&self.groups),
            EntityKind::Cos => Some(&self.cos),
            _ => None,
        }
    }

    pub(crate) fn cache_entity(&self, entity: &Arc<Entity>) {
        if let Some(cache) = self.cache_for(entity.kind) {
            cache.put(entity.clone());
        }
    }

    /// Drop every cached trace of an entity. Used after mutations and after
    /// rename attempts, successful or not.
    pub(crate) fn evict_entity(&self, entity: &Entity) {
        if let Some(cache) = self.cache_for(entity.kind) {
            cache.remove(entity);
        }
        self.computed.invalidate(entity.id);
        if entity.kind.is_group() {
            self.acl_groups.invalidate_all();
            self.dl_addresses_remove(&entity.addresses());
        }
    }

    pub fn flush_cache(&self, kind: CacheKind) {
        match kind {
            CacheKind::Account => {
                self.accounts.clear();
                self.computed.clear();
            }
            CacheKind::Domain => {
                self.domains.clear();
                self.negative_domains.clear();
            }
            CacheKind::Group => {
                self.groups.clear();
                self.acl_groups.invalidate_all();
                self.computed.clear();
                *self.dl_addresses.write().unwrap() = None;
            }
            CacheKind::Cos => self.cos.clear(),
            CacheKind::AclGroup => self.acl_groups.invalidate_all(),
            CacheKind::GlobalConfig => {
                *self.global_config.lock().unwrap() = None;
                *self.global_grant.lock().unwrap() = None;
            }
            CacheKind::All => {
                for kind in [
                    CacheKind::Account,
                    CacheKind::Domain,
                    CacheKind::Group,
                    CacheKind::Cos,
                    CacheKind::GlobalConfig,
                ] {
                    self.flush_cache(kind);
                }
            }
        }
        info!(?kind, "cache flushed");
    }

    pub fn cache_stats(&self) -> EngineCacheStats {
        EngineCacheStats {
            accounts: self.accounts.stats(),
            domains: self.domains.stats(),
            groups: self.groups.stats(),
            cos: self.cos.stats(),
            acl_groups: self.acl_groups.stats(),
        }
    }

    // ==================== Global entries ====================

    /// The global configuration entry, built once and refreshed only by
    /// [`flush_cache`](Self::flush_cache)
    pub async fn global_config(&self) -> Result<Arc<crate::domain::AttrMap>> {
        if let Some(attrs) = self.global_config.lock().unwrap().clone() {
            return Ok(attrs);
        }
        let dn = self.dit.global_config_dn();
        let entry = self
            .store
            .get_by_dn(&dn)
            .await?
            .ok_or_else(|| AppError::not_found("global config", dn))?;
        let attrs = Arc::new(entry.attrs);
        let mut slot = self.global_config.lock().unwrap();
        // another request may have won the race; keep the first copy
        Ok(slot.get_or_insert_with(|| attrs).clone())
    }

    /// The global grant entry consulted by the rights engine
    pub async fn global_grant(&self) -> Result<Arc<crate::domain::AttrMap>> {
        if let Some(attrs) = self.global_grant.lock().unwrap().clone() {
            return Ok(attrs);
        }
        let dn = self.dit.global_grant_dn();
        let entry = self
            .store
            .get_by_dn(&dn)
            .await?
            .ok_or_else(|| AppError::not_found("global grant", dn))?;
        let attrs = Arc::new(entry.attrs);
        let mut slot = self.global_grant.lock().unwrap();
        Ok(slot.get_or_insert_with(|| attrs).clone())
    }

    // ==================== Generic modify path ====================

    /// Apply attribute mutations to an entity.
    ///
    /// This is the only sanctioned way to change attributes: it enforces
    /// schema immutability, reloads the entry so the cache never holds a
    /// half-applied state, and fires the invalidation the side caches
    /// depend on.
    pub async fn modify_attrs(
        &self,
        entity: &Entity,
        mods: Vec<Modification>,
    ) -> Result<Arc<Entity>> {
        for modification in &mods {
            let attr = modification.attr_name();
            if self.schema.is_immutable(attr) {
                return Err(AppError::InvalidInput(format!(
                    "attribute {attr} is immutable"
                )));
            }
        }

        let membership_affecting = entity.kind.is_group()
            || mods.iter().any(|m| {
                m.attr_name() == names::A_LIST_MEMBER || m.attr_name() == names::A_MAIL_ALIAS
            });

        self.store.modify(&entity.dn, mods).await?;
        self.computed.invalidate(entity.id);
        if membership_affecting {
            self.acl_groups.invalidate_all();
        }
        if entity.kind.is_group() {
            // alias changes alter the list's address set
            self.dl_addresses_remove(&entity.addresses());
        }

        let refreshed = self.reload_entity(entity).await?;
        if entity.kind.is_group() {
            self.dl_addresses_add(&refreshed.addresses());
        }
        Ok(refreshed)
    }

    /// Reload an entity from the directory and replace its cache entry
    pub(crate) async fn reload_entity(&self, entity: &Entity) -> Result<Arc<Entity>> {
        let entry = self
            .store
            .get_by_dn(&entity.dn)
            .await?
            .ok_or_else(|| AppError::not_found(entity.kind.as_str(), entity.dn.clone()))?;
        let refreshed = self.make_entity(entry, true).await?;
        if let Some(cache) = self.cache_for(refreshed.kind) {
            cache.replace(refreshed.clone());
        }
        Ok(refreshed)
    }

    // ==================== Directory listing ====================

    /// Generic listing over the store, used by admin listings and the
    /// internal GAL path
    pub async fn search_directory(
        &self,
        opts: SearchDirectoryOptions,
    ) -> Result<Vec<Arc<Entity>>> {
        let kinds = if opts.kinds.is_empty() {
            vec![
                EntityKind::Account,
                EntityKind::CalendarResource,
                EntityKind::DistributionList,
            ]
        } else {
            opts.kinds
        };
        let kind_filter = Filter::or(
            kinds
                .iter()
                .map(|k| Filter::object_class(k.object_class()))
                .collect(),
        );
        let filter = match opts.filter {
            Some(extra) => Filter::and(vec![kind_filter, extra]),
            None => kind_filter,
        };

        let base = match &opts.domain {
            Some(domain) => self.dit.domain_dn(domain),
            None => self.dit.base_dn().to_string(),
        };
        let page = self
            .store
            .search(
                &base,
                SearchScope::Subtree,
                &filter,
                &SearchOptions {
                    size_limit: opts.max_results,
                    read_from_master: opts.read_from_master,
                    ..Default::default()
                },
            )
            .await?;

        let mut entities = Vec::with_capacity(page.entries.len());
        for entry in page.entries {
            entities.push(self.make_entity(entry, true).await?);
        }
        Ok(entities)
    }

    // ==================== Distribution list address set ====================

    /// Cheap membership test: is this address a distribution list (by any
    /// of its addresses)? The set is built lazily and then maintained
    /// incrementally on every list create/delete/alias change.
    pub async fn is_distribution_list_address(&self, address: &str) -> Result<bool> {
        let address = crate::domain::normalize_address(address)?;
        if let Some(set) = self.dl_addresses.read().unwrap().as_ref() {
            return Ok(set.contains(&address));
        }

        let loaded = self.load_dl_addresses().await?;
        let contains = loaded.contains(&address);
        let mut slot = self.dl_addresses.write().unwrap();
        if slot.is_none() {
            *slot = Some(loaded);
        }
        Ok(contains)
    }

    async fn load_dl_addresses(&self) -> Result<HashSet<String>> {
        let page = self
            .store
            .search(
                self.dit.base_dn(),
                SearchScope::Subtree,
                &Filter::object_class(EntityKind::DistributionList.object_class()),
                &SearchOptions::default(),
            )
            .await?;

        let mut set = HashSet::new();
        for entry in &page.entries {
            if let Some(mail) = entry.attrs.get(names::A_MAIL) {
                set.insert(mail.to_lowercase());
            }
            for alias in entry.attrs.get_all(names::A_MAIL_ALIAS) {
                set.insert(alias.to_lowercase());
            }
        }
        Ok(set)
    }

    pub(crate) fn dl_addresses_add(&self, addresses: &[String]) {
        if let Some(set) = self.dl_addresses.write().unwrap().as_mut() {
            for address in addresses {
                set.insert(address.to_lowercase());
            }
        }
    }

    pub(crate) fn dl_addresses_remove(&self, addresses: &[String]) {
        if let Some(set) = self.dl_addresses.write().unwrap().as_mut() {
            for address in addresses {
                set.remove(&address.to_lowercase());
            }
        }
    }
}
