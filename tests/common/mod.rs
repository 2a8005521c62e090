//! Shared test harness: an engine wired to in-memory stores
#![allow(dead_code)]

use async_trait::async_trait;
use provis_core::config::Config;
use provis_core::directory::{
    DirEntry, DirectoryStore, ExternalDirectory, Filter, MemoryStore, Modification, SearchOptions,
    SearchPage, SearchScope, StaticSchema,
};
use provis_core::domain::{names, AttrMap};
use provis_core::error::Result;
use provis_core::service::Provisioning;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const BASE_DN: &str = "cn=provis";

/// Wraps the in-memory store and counts search round-trips, so tests can
/// assert that a cache hit issued no directory search
pub struct CountingStore {
    inner: MemoryStore,
    searches: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            searches: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn search_count(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryStore for CountingStore {
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(base, scope, filter, opts).await
    }

    async fn get_by_dn(&self, dn: &str) -> Result<Option<DirEntry>> {
        self.inner.get_by_dn(dn).await
    }

    async fn add(&self, dn: &str, attrs: AttrMap) -> Result<()> {
        self.inner.add(dn, attrs).await
    }

    async fn modify(&self, dn: &str, mods: Vec<Modification>) -> Result<()> {
        self.inner.modify(dn, mods).await
    }

    async fn rename(&self, dn: &str, new_dn: &str) -> Result<()> {
        self.inner.rename(dn, new_dn).await
    }

    async fn delete(&self, dn: &str) -> Result<()> {
        self.inner.delete(dn).await
    }

    async fn bind(&self, dn: &str, password: &str) -> Result<bool> {
        self.inner.bind(dn, password).await
    }
}

/// External directory backed by a second in-memory store; the URL from the
/// domain configuration is accepted and ignored
pub struct FakeExternal(pub Arc<MemoryStore>);

#[async_trait]
impl ExternalDirectory for FakeExternal {
    async fn bind(&self, _url: &str, dn: &str, password: &str) -> Result<bool> {
        self.0.bind(dn, password).await
    }

    async fn search(
        &self,
        _url: &str,
        base: &str,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage> {
        self.0.search(base, SearchScope::Subtree, filter, opts).await
    }
}

pub struct TestEnv {
    pub engine: Arc<Provisioning>,
    pub store: Arc<CountingStore>,
    pub external: Arc<MemoryStore>,
}

pub async fn test_env() -> TestEnv {
    test_env_with_config(Config::default()).await
}

pub async fn test_env_with_config(config: Config) -> TestEnv {
    let store = Arc::new(CountingStore::new());
    let external = Arc::new(MemoryStore::new());
    let engine = Provisioning::new(
        config,
        store.clone(),
        Arc::new(FakeExternal(external.clone())),
        Arc::new(StaticSchema::new()),
        BASE_DN,
    );

    // the entries every deployment carries
    let mut config_attrs = AttrMap::new();
    config_attrs.set(names::A_OBJECT_CLASS, "provisGlobalConfig");
    config_attrs.set("cn", "config");
    store
        .inner()
        .add(&format!("cn=config,{BASE_DN}"), config_attrs)
        .await
        .unwrap();

    let mut grant_attrs = AttrMap::new();
    grant_attrs.set(names::A_OBJECT_CLASS, "provisGlobalGrant");
    grant_attrs.set("cn", "globalgrant");
    store
        .inner()
        .add(&format!("cn=globalgrant,{BASE_DN}"), grant_attrs)
        .await
        .unwrap();

    TestEnv {
        engine,
        store,
        external,
    }
}

/// Seed a class of service directly in the store
pub async fn seed_cos(store: &MemoryStore, name: &str, extra: &[(&str, &str)]) -> Uuid {
    let id = Uuid::new_v4();
    let mut attrs = AttrMap::new();
    attrs.set(names::A_OBJECT_CLASS, "provisCos");
    attrs.set(names::A_PROVIS_ID, id.to_string());
    attrs.set(names::A_CN, name);
    for (attr, value) in extra {
        attrs.set(attr, value.to_string());
    }
    store
        .add(&format!("cn={name},cn=cos,{BASE_DN}"), attrs)
        .await
        .unwrap();
    id
}

/// Seed an XMPP component registration directly in the store
pub async fn seed_xmpp_component(store: &MemoryStore, name: &str, domain: &str) {
    let mut attrs = AttrMap::new();
    attrs.set(names::A_OBJECT_CLASS, "provisXmppComponent");
    attrs.set(names::A_PROVIS_ID, Uuid::new_v4().to_string());
    attrs.set(names::A_CN, name);
    attrs.set(names::A_COMPONENT_DOMAIN, domain);
    store
        .add(&format!("cn={name},cn=xmppcomponents,{BASE_DN}"), attrs)
        .await
        .unwrap();
}
