//! In-memory directory store
//!
//! A complete, dependency-free implementation of [`DirectoryStore`] over a
//! sorted map of DN to attributes. The integration tests drive the whole
//! engine against it; it is also handy as a fake external directory for
//! auth and GAL federation tests (it honors bind and paged search).

use crate::directory::{
    dn, DirEntry, DirectoryStore, Filter, Modification, SearchOptions, SearchPage, SearchScope,
};
use crate::domain::{names, AttrMap};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    // keyed by lower-cased DN; the entry keeps the original spelling
    entries: Mutex<BTreeMap<String, DirEntry>>,
    bind_outage: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a directory outage for bind operations: `bind` returns a
    /// transient failure instead of a verdict while enabled
    pub fn set_bind_outage(&self, outage: bool) {
        self.bind_outage.store(outage, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn in_scope(entry_dn: &str, base: &str, scope: SearchScope) -> bool {
        match scope {
            SearchScope::Base => entry_dn.eq_ignore_ascii_case(base),
            SearchScope::OneLevel => dn::is_child_of(entry_dn, base),
            SearchScope::Subtree => {
                entry_dn.eq_ignore_ascii_case(base) || dn::is_under(entry_dn, base)
            }
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage> {
        let entries = self.entries.lock().unwrap();
        let matched: Vec<DirEntry> = entries
            .values()
            .filter(|e| Self::in_scope(&e.dn, base, scope))
            .filter(|e| filter.matches(&e.attrs))
            .cloned()
            .collect();

        let start: usize = match &opts.cookie {
            Some(cookie) => cookie
                .parse()
                .map_err(|_| AppError::Directory(format!("bad paging cookie: {cookie}")))?,
            None => 0,
        };
        let start = start.min(matched.len());

        let remaining = matched.len() - start;
        let mut limit = remaining;
        if opts.page_size > 0 {
            limit = limit.min(opts.page_size as usize);
        }
        if opts.size_limit > 0 {
            limit = limit.min(opts.size_limit);
        }
        let end = start + limit;

        // hitting the size limit is a truncation, same as a server's
        // sizeLimitExceeded; a cookie is only offered for further pages
        // within the size budget
        let truncated = opts.size_limit > 0 && limit == opts.size_limit && remaining > limit;
        let cookie =
            (!truncated && end < matched.len() && opts.page_size > 0).then(|| end.to_string());

        Ok(SearchPage {
            entries: matched[start..end].to_vec(),
            cookie,
            truncated,
        })
    }

    async fn get_by_dn(&self, dn: &str) -> Result<Option<DirEntry>> {
        Ok(self.entries.lock().unwrap().get(&dn.to_lowercase()).cloned())
    }

    async fn add(&self, dn: &str, attrs: AttrMap) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let key = dn.to_lowercase();
        if entries.contains_key(&key) {
            return Err(AppError::AlreadyExists(dn.to_string()));
        }
        entries.insert(
            key,
            DirEntry {
                dn: dn.to_string(),
                attrs,
            },
        );
        Ok(())
    }

    async fn modify(&self, dn: &str, mods: Vec<Modification>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&dn.to_lowercase())
            .ok_or_else(|| AppError::not_found("entry", dn))?;

        for modification in mods {
            match modification {
                Modification::Replace(name, values) => entry.attrs.set_multi(&name, values),
                Modification::Add(name, values) => {
                    for value in values {
                        entry.attrs.add_value(&name, value);
                    }
                }
                Modification::DeleteValues(name, values) => {
                    for value in values {
                        entry.attrs.remove_value(&name, &value);
                    }
                }
                Modification::DeleteAttr(name) => {
                    entry.attrs.remove(&name);
                }
            }
        }
        Ok(())
    }

    async fn rename(&self, old_dn: &str, new_dn: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let old_key = old_dn.to_lowercase();
        let new_key = new_dn.to_lowercase();
        if !entries.contains_key(&old_key) {
            return Err(AppError::not_found("entry", old_dn));
        }
        if entries.contains_key(&new_key) {
            return Err(AppError::AlreadyExists(new_dn.to_string()));
        }

        // move the record and everything under it
        let moved: Vec<String> = entries
            .keys()
            .filter(|k| *k == &old_key || dn::is_under(k, &old_key))
            .cloned()
            .collect();
        for key in moved {
            let entry = entries.remove(&key).expect("key listed above");
            let suffix = &entry.dn[..entry.dn.len() - old_dn.len()];
            let relocated = format!("{suffix}{new_dn}");
            entries.insert(
                relocated.to_lowercase(),
                DirEntry {
                    dn: relocated,
                    attrs: entry.attrs,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, dn: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let key = dn.to_lowercase();
        if !entries.contains_key(&key) {
            return Err(AppError::not_found("entry", dn));
        }
        if entries.keys().any(|k| dn::is_under(k, &key)) {
            return Err(AppError::Directory(format!(
                "subordinate entries exist under {dn}"
            )));
        }
        entries.remove(&key);
        Ok(())
    }

    async fn bind(&self, dn: &str, password: &str) -> Result<bool> {
        if self.bind_outage.load(Ordering::SeqCst) {
            return Err(AppError::Directory(
                "bind failed: directory unavailable".to_string(),
            ));
        }
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(&dn.to_lowercase())
            .and_then(|e| e.attrs.get(names::A_PASSWORD))
            .is_some_and(|stored| stored == password))
    }
}
