//! Directory store abstraction
//!
//! The engine never speaks the wire protocol itself. Everything it needs
//! from the directory goes through [`DirectoryStore`]: escaped-filter
//! subtree search with paging, and single-record get/add/modify/rename/
//! delete/bind. Two implementations ship with the crate: [`ldap::LdapStore`]
//! over the `ldap3` client, and [`memory::MemoryStore`] used by the
//! integration tests.

pub mod dit;
pub mod external;
pub mod filter;
pub mod ldap;
pub mod memory;
pub mod schema;

pub use dit::Dit;
pub use external::{ExternalDirectory, LdapExternalDirectory};
pub use filter::Filter;
pub use ldap::LdapStore;
pub use memory::MemoryStore;
pub use schema::{AttrSchema, StaticSchema};

use crate::domain::AttrMap;
use crate::error::Result;
use async_trait::async_trait;

/// A raw directory record: distinguished name plus attributes
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
    pub dn: String,
    pub attrs: AttrMap,
}

/// Search scope relative to the base DN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

/// Search tuning: result cap, paging, and replica selection
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum entries to return; 0 means unlimited
    pub size_limit: usize,
    /// Native page size; 0 disables paging
    pub page_size: u32,
    /// Opaque paging cookie from a previous [`SearchPage`]
    pub cookie: Option<String>,
    /// Route the operation to the master rather than a replica
    pub read_from_master: bool,
}

impl SearchOptions {
    pub fn master() -> Self {
        Self {
            read_from_master: true,
            ..Default::default()
        }
    }

    pub fn limited(size_limit: usize) -> Self {
        Self {
            size_limit,
            ..Default::default()
        }
    }
}

/// One page of search results. `cookie` is `Some` while more pages remain.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub entries: Vec<DirEntry>,
    pub cookie: Option<String>,
    /// True when the server truncated the result at the size limit
    pub truncated: bool,
}

/// A single attribute mutation within a modify operation
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    /// Replace all values of the attribute (empty clears it)
    Replace(String, Vec<String>),
    /// Add values, keeping existing ones
    Add(String, Vec<String>),
    /// Delete specific values
    DeleteValues(String, Vec<String>),
    /// Delete the attribute entirely
    DeleteAttr(String),
}

impl Modification {
    pub fn attr_name(&self) -> &str {
        match self {
            Modification::Replace(name, _)
            | Modification::Add(name, _)
            | Modification::DeleteValues(name, _)
            | Modification::DeleteAttr(name) => name,
        }
    }
}

/// The directory client collaborator.
///
/// Every operation is synchronous from the caller's point of view and is
/// never retried at this layer; transient failures surface as
/// `AppError::Directory`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Escaped-filter search under `base`
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        opts: &SearchOptions,
    ) -> Result<SearchPage>;

    /// Fetch a single record by DN
    async fn get_by_dn(&self, dn: &str) -> Result<Option<DirEntry>>;

    /// Create a record; `AlreadyExists` if the DN is taken
    async fn add(&self, dn: &str, attrs: AttrMap) -> Result<()>;

    /// Apply attribute mutations to a record
    async fn modify(&self, dn: &str, mods: Vec<Modification>) -> Result<()>;

    /// Move a record to a new DN
    async fn rename(&self, dn: &str, new_dn: &str) -> Result<()>;

    /// Delete a record; children must be gone first
    async fn delete(&self, dn: &str) -> Result<()>;

    /// Verify credentials by binding as `dn`.
    ///
    /// `Ok(true)` means verified, `Ok(false)` means the directory rejected
    /// the credential, `Err` means the bind could not be executed at all.
    /// Callers use the distinction for the internal-fallback decision.
    async fn bind(&self, dn: &str, password: &str) -> Result<bool>;
}

/// DN helpers shared by the stores and the rename orchestrator
pub mod dn {
    /// Escape a value for use inside a DN component (RFC 4514)
    pub fn escape_rdn_value(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for (i, c) in value.chars().enumerate() {
            match c {
                ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                    out.push('\\');
                    out.push(c);
                }
                '#' | ' ' if i == 0 => {
                    out.push('\\');
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        if out.ends_with(' ') {
            out.insert(out.len() - 1, '\\');
        }
        out
    }

    /// Parent of a DN, or None at the root
    pub fn parent(dn: &str) -> Option<&str> {
        split_unescaped(dn).map(|(_, parent)| parent)
    }

    /// Leading RDN of a DN
    pub fn rdn(dn: &str) -> &str {
        split_unescaped(dn).map(|(rdn, _)| rdn).unwrap_or(dn)
    }

    /// True if `dn` sits anywhere under `base` (exclusive)
    pub fn is_under(dn: &str, base: &str) -> bool {
        let dn = dn.to_lowercase();
        let base = base.to_lowercase();
        dn.len() > base.len() && dn.ends_with(&base) && dn.as_bytes()[dn.len() - base.len() - 1] == b','
    }

    /// True if `dn` is a direct child of `base`
    pub fn is_child_of(dn: &str, base: &str) -> bool {
        is_under(dn, base) && parent(dn).is_some_and(|p| p.eq_ignore_ascii_case(base))
    }

    fn split_unescaped(dn: &str) -> Option<(&str, &str)> {
        let bytes = dn.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b',' => return Some((&dn[..i], &dn[i + 1..])),
                _ => i += 1,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::dn;

    #[test]
    fn test_rdn_and_parent() {
        let full = "uid=user,ou=people,dc=example,dc=com";
        assert_eq!(dn::rdn(full), "uid=user");
        assert_eq!(dn::parent(full), Some("ou=people,dc=example,dc=com"));
    }

    #[test]
    fn test_escaped_comma_not_a_separator() {
        let full = "cn=Last\\, First,ou=people,dc=example,dc=com";
        assert_eq!(dn::rdn(full), "cn=Last\\, First");
        assert_eq!(dn::parent(full), Some("ou=people,dc=example,dc=com"));
    }

    #[test]
    fn test_is_under() {
        assert!(dn::is_under(
            "uid=user,ou=people,dc=example,dc=com",
            "dc=example,dc=com"
        ));
        assert!(!dn::is_under("dc=example,dc=com", "dc=example,dc=com"));
        assert!(!dn::is_under(
            "uid=user,dc=badexample,dc=com",
            "dc=example,dc=com"
        ));
    }

    #[test]
    fn test_is_child_of() {
        assert!(dn::is_child_of(
            "uid=user,ou=people,dc=example,dc=com",
            "ou=people,dc=example,dc=com"
        ));
        assert!(!dn::is_child_of(
            "uid=user,ou=people,dc=example,dc=com",
            "dc=example,dc=com"
        ));
    }

    #[test]
    fn test_escape_rdn_value() {
        assert_eq!(dn::escape_rdn_value("a,b=c"), "a\\,b\\=c");
        assert_eq!(dn::escape_rdn_value("#leading"), "\\#leading");
    }
}
