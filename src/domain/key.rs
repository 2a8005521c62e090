//! Lookup keys and name normalization
//!
//! Every resolver entry point takes a typed key. Name-valued keys are
//! normalized (lower-cased, internationalized domains ASCII-encoded) before
//! they touch a cache or a directory filter, so that the same logical name
//! always hits the same cache slot.

use crate::error::{AppError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

lazy_static! {
    // post-IDNA domain names are plain LDH labels
    static ref DOMAIN_NAME_RE: Regex =
        Regex::new(r"^[a-z0-9]([a-z0-9\-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9\-]*[a-z0-9])?)*$")
            .expect("domain name pattern");
}

/// Key for account and calendar-resource lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountKey {
    Id(Uuid),
    /// Primary address or alias address
    Name(String),
    ForeignPrincipal(String),
    /// Admin login name without a domain part
    AdminName(String),
    Krb5Principal(String),
}

/// Key for domain lookups. The last three come from externally supplied
/// values whose absence is expensive to re-verify, so they are negatively
/// cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainKey {
    Id(Uuid),
    Name(String),
    VirtualHostname(String),
    ForeignName(String),
    Krb5Realm(String),
}

/// Key for distribution-list lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    Id(Uuid),
    Name(String),
}

/// Normalize a bare domain name: trim, lower-case, IDNA-encode, validate
pub fn normalize_domain(name: &str) -> Result<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Err(AppError::InvalidInput("empty domain name".to_string()));
    }
    let name = if name.is_ascii() {
        name
    } else {
        idna::domain_to_ascii(&name).map_err(|_| {
            AppError::InvalidInput(format!("invalid internationalized domain: {name}"))
        })?
    };
    if !DOMAIN_NAME_RE.is_match(&name) {
        return Err(AppError::InvalidInput(format!("invalid domain name: {name}")));
    }
    Ok(name)
}

/// Normalize an email address: lower-case the whole address and IDNA-encode
/// the domain part. A missing domain part is an input error; addresses in
/// the directory are always fully qualified.
pub fn normalize_address(addr: &str) -> Result<String> {
    let addr = addr.trim();
    let (local, domain) = addr
        .split_once('@')
        .ok_or_else(|| AppError::InvalidInput(format!("address without domain: {addr}")))?;
    if local.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "address without local part: {addr}"
        )));
    }
    let domain = normalize_domain(domain)?;
    Ok(format!("{}@{}", local.to_lowercase(), domain))
}

/// Swap the domain part of an address, keeping the local part
pub fn replace_domain(addr: &str, new_domain: &str) -> Result<String> {
    let (local, _) = addr
        .split_once('@')
        .ok_or_else(|| AppError::InvalidInput(format!("address without domain: {addr}")))?;
    Ok(format!("{local}@{new_domain}"))
}

impl AccountKey {
    /// Normalize name-valued keys in place; id keys pass through
    pub fn normalized(self) -> Result<Self> {
        Ok(match self {
            AccountKey::Name(name) => AccountKey::Name(normalize_address(&name)?),
            AccountKey::AdminName(name) => AccountKey::AdminName(name.trim().to_lowercase()),
            other => other,
        })
    }
}

impl DomainKey {
    pub fn normalized(self) -> Result<Self> {
        Ok(match self {
            DomainKey::Name(name) => DomainKey::Name(normalize_domain(&name)?),
            DomainKey::VirtualHostname(host) => DomainKey::VirtualHostname(normalize_domain(&host)?),
            other => other,
        })
    }
}
