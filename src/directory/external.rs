//! External directory collaborator
//!
//! Per-domain configuration can point authentication and GAL searches at a
//! directory other than the engine's own store. The engine reaches those
//! through [`ExternalDirectory`], keyed by the URL from the domain
//! attributes, so tests can swap in a fake without network access.

use crate::directory::{DirectoryStore, Filter, LdapStore, SearchOptions, SearchPage, SearchScope};
use crate::error::Result;
use async_trait::async_trait;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalDirectory: Send + Sync {
    /// Verify credentials against the external directory.
    ///
    /// Same verdict contract as [`DirectoryStore::bind`]: `Ok(false)` is a
    /// rejected credential, `Err` means the mechanism failed to execute.
    ///
    /// [`DirectoryStore::bind`]: crate::directory::DirectoryStore::bind
    async fn bind(&self, url: &str, dn: &str, password: &str) -> Result<bool>;

    /// Search the external directory, for search-then-bind and GAL
    async fn search(
        &self,
        url: &str,
        base: &str,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage>;
}

/// Production connector: one-shot `ldap3` connections per operation
#[derive(Default)]
pub struct LdapExternalDirectory;

impl LdapExternalDirectory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExternalDirectory for LdapExternalDirectory {
    async fn bind(&self, url: &str, dn: &str, password: &str) -> Result<bool> {
        LdapStore::new(url, None, None).bind(dn, password).await
    }

    async fn search(
        &self,
        url: &str,
        base: &str,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage> {
        LdapStore::new(url, None, None)
            .search(base, SearchScope::Subtree, filter, opts)
            .await
    }
}
