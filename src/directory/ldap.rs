//! LDAP wire adapter
//!
//! Thin [`DirectoryStore`] implementation over the `ldap3` client. All
//! protocol knowledge lives here: result-code mapping, paged search,
//! master/replica routing. Connections are opened per operation; the
//! deployment fronts the directory with its own connection pooling when it
//! needs it.

use crate::directory::{
    dn, DirEntry, DirectoryStore, Filter, Modification, SearchOptions, SearchPage, SearchScope,
};
use crate::domain::AttrMap;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapResult, Mod, Scope, SearchEntry};
use std::collections::HashSet;

// LDAP result codes the engine distinguishes
const RC_SUCCESS: u32 = 0;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_NOT_ALLOWED_ON_NON_LEAF: u32 = 66;
const RC_ALREADY_EXISTS: u32 = 68;

/// Bind identity used for directory operations
#[derive(Debug, Clone)]
pub struct BindCredentials {
    pub dn: String,
    pub password: String,
}

/// `DirectoryStore` over one master endpoint and an optional replica
pub struct LdapStore {
    master_url: String,
    replica_url: Option<String>,
    credentials: Option<BindCredentials>,
}

impl LdapStore {
    pub fn new(
        master_url: impl Into<String>,
        replica_url: Option<String>,
        credentials: Option<BindCredentials>,
    ) -> Self {
        Self {
            master_url: master_url.into(),
            replica_url,
            credentials,
        }
    }

    async fn connect(&self, master: bool) -> Result<Ldap> {
        let url = if master {
            &self.master_url
        } else {
            self.replica_url.as_ref().unwrap_or(&self.master_url)
        };
        let (conn, mut ldap) = LdapConnAsync::new(url).await?;
        ldap3::drive!(conn);
        if let Some(credentials) = &self.credentials {
            ldap.simple_bind(&credentials.dn, &credentials.password)
                .await?
                .success()?;
        }
        Ok(ldap)
    }

    fn map_write_result(res: LdapResult, dn: &str) -> Result<()> {
        match res.rc {
            RC_SUCCESS => Ok(()),
            RC_NO_SUCH_OBJECT => Err(AppError::not_found("entry", dn)),
            RC_ALREADY_EXISTS => Err(AppError::AlreadyExists(dn.to_string())),
            RC_NOT_ALLOWED_ON_NON_LEAF => Err(AppError::Directory(format!(
                "subordinate entries exist under {dn}"
            ))),
            rc => Err(AppError::Directory(format!(
                "directory operation on {dn} failed: rc={rc} {}",
                res.text
            ))),
        }
    }

    fn to_dir_entry(entry: SearchEntry) -> DirEntry {
        let mut attrs = AttrMap::new();
        for (name, values) in entry.attrs {
            attrs.set_multi(&name, values);
        }
        // binary values are carried base64-encoded; the schema collaborator
        // tells callers which attributes need decoding
        for (name, values) in entry.bin_attrs {
            attrs.set_multi(
                &name,
                values.iter().map(|v| BASE64.encode(v)).collect(),
            );
        }
        DirEntry {
            dn: entry.dn,
            attrs,
        }
    }

    fn to_scope(scope: SearchScope) -> Scope {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

#[async_trait]
impl DirectoryStore for LdapStore {
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage> {
        let mut ldap = self.connect(opts.read_from_master).await?;
        let filter = filter.to_string();
        let scope = Self::to_scope(scope);
        let mut entries = Vec::new();
        let mut truncated = false;

        if opts.page_size > 0 {
            let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
                Box::new(EntriesOnly::new()),
                Box::new(PagedResults::new(opts.page_size as i32)),
            ];
            let mut stream = ldap
                .streaming_search_with(adapters, base, scope, &filter, vec!["*"])
                .await?;
            while let Some(entry) = stream.next().await? {
                entries.push(Self::to_dir_entry(SearchEntry::construct(entry)));
                if opts.size_limit > 0 && entries.len() >= opts.size_limit {
                    truncated = true;
                    break;
                }
            }
            let _ = stream.finish().await;
        } else {
            let (results, _res) = ldap
                .search(base, scope, &filter, vec!["*"])
                .await?
                .success()
                .map_err(AppError::from)?;
            for entry in results {
                entries.push(Self::to_dir_entry(SearchEntry::construct(entry)));
                if opts.size_limit > 0 && entries.len() >= opts.size_limit {
                    truncated = true;
                    break;
                }
            }
        }

        ldap.unbind().await.ok();
        // the adapter drains native pages internally; cross-call cookies are
        // a capability of stores that expose them
        Ok(SearchPage {
            entries,
            cookie: None,
            truncated,
        })
    }

    async fn get_by_dn(&self, target: &str) -> Result<Option<DirEntry>> {
        let mut ldap = self.connect(false).await?;
        let result = ldap
            .search(target, Scope::Base, "(objectClass=*)", vec!["*"])
            .await?;
        ldap.unbind().await.ok();

        let (entries, res) = (result.0, result.1);
        match res.rc {
            RC_SUCCESS => Ok(entries
                .into_iter()
                .next()
                .map(|e| Self::to_dir_entry(SearchEntry::construct(e)))),
            RC_NO_SUCH_OBJECT => Ok(None),
            rc => Err(AppError::Directory(format!(
                "lookup of {target} failed: rc={rc} {}",
                res.text
            ))),
        }
    }

    async fn add(&self, target: &str, attrs: AttrMap) -> Result<()> {
        let mut ldap = self.connect(true).await?;
        let values: Vec<(String, HashSet<String>)> = attrs
            .iter()
            .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
            .collect();
        let res = ldap.add(target, values).await?;
        ldap.unbind().await.ok();
        Self::map_write_result(res, target)
    }

    async fn modify(&self, target: &str, mods: Vec<Modification>) -> Result<()> {
        let mut ldap = self.connect(true).await?;
        let mods: Vec<Mod<String>> = mods
            .into_iter()
            .map(|m| match m {
                Modification::Replace(name, values) => {
                    Mod::Replace(name, values.into_iter().collect())
                }
                Modification::Add(name, values) => Mod::Add(name, values.into_iter().collect()),
                Modification::DeleteValues(name, values) => {
                    Mod::Delete(name, values.into_iter().collect())
                }
                Modification::DeleteAttr(name) => Mod::Delete(name, HashSet::new()),
            })
            .collect();
        let res = ldap.modify(target, mods).await?;
        ldap.unbind().await.ok();
        Self::map_write_result(res, target)
    }

    async fn rename(&self, old_dn: &str, new_dn: &str) -> Result<()> {
        let new_rdn = dn::rdn(new_dn);
        let new_parent = dn::parent(new_dn);
        let mut ldap = self.connect(true).await?;
        let res = ldap
            .modifydn(old_dn, new_rdn, true, new_parent)
            .await?;
        ldap.unbind().await.ok();
        Self::map_write_result(res, old_dn)
    }

    async fn delete(&self, target: &str) -> Result<()> {
        let mut ldap = self.connect(true).await?;
        let res = ldap.delete(target).await?;
        ldap.unbind().await.ok();
        Self::map_write_result(res, target)
    }

    async fn bind(&self, target: &str, password: &str) -> Result<bool> {
        // an empty password would be an unauthenticated bind, which every
        // server accepts; it must never count as a verified credential
        if password.is_empty() {
            return Ok(false);
        }
        let (conn, mut ldap) = LdapConnAsync::new(&self.master_url).await?;
        ldap3::drive!(conn);
        let res = ldap.simple_bind(target, password).await?;
        ldap.unbind().await.ok();
        match res.rc {
            RC_SUCCESS => Ok(true),
            RC_INVALID_CREDENTIALS => Ok(false),
            rc => Err(AppError::Directory(format!(
                "bind as {target} failed: rc={rc} {}",
                res.text
            ))),
        }
    }
}
