//! Directory entity model
//!
//! Every directory-backed object (account, calendar resource, distribution
//! list, alias, domain, class-of-service, server) is an [`Entity`]: a stable
//! id, a unique name, the directory's distinguished name, and an attribute
//! map. The concrete kind is decided once, from the entry's object classes,
//! when the entity is constructed.

use crate::domain::attrs::{names, AttrMap};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of entity kinds, dispatched from directory object classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    CalendarResource,
    DistributionList,
    Alias,
    Domain,
    Cos,
    Server,
    XmppComponent,
}

impl EntityKind {
    /// Map directory object classes to a kind.
    ///
    /// Calendar resources also carry the account object class, so the more
    /// specific classes are checked first.
    pub fn from_object_classes(classes: &[String]) -> Option<Self> {
        let has = |oc: &str| classes.iter().any(|c| c.eq_ignore_ascii_case(oc));
        if has("provisCalendarResource") {
            Some(EntityKind::CalendarResource)
        } else if has("provisAccount") {
            Some(EntityKind::Account)
        } else if has("provisDistributionList") {
            Some(EntityKind::DistributionList)
        } else if has("provisAlias") {
            Some(EntityKind::Alias)
        } else if has("provisDomain") {
            Some(EntityKind::Domain)
        } else if has("provisCos") {
            Some(EntityKind::Cos)
        } else if has("provisServer") {
            Some(EntityKind::Server)
        } else if has("provisXmppComponent") {
            Some(EntityKind::XmppComponent)
        } else {
            None
        }
    }

    pub fn object_class(&self) -> &'static str {
        match self {
            EntityKind::Account => "provisAccount",
            EntityKind::CalendarResource => "provisCalendarResource",
            EntityKind::DistributionList => "provisDistributionList",
            EntityKind::Alias => "provisAlias",
            EntityKind::Domain => "provisDomain",
            EntityKind::Cos => "provisCos",
            EntityKind::Server => "provisServer",
            EntityKind::XmppComponent => "provisXmppComponent",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::CalendarResource => "calendar resource",
            EntityKind::DistributionList => "distribution list",
            EntityKind::Alias => "alias",
            EntityKind::Domain => "domain",
            EntityKind::Cos => "cos",
            EntityKind::Server => "server",
            EntityKind::XmppComponent => "xmpp component",
        }
    }

    /// Entities addressed by an email address
    pub fn has_address(&self) -> bool {
        matches!(
            self,
            EntityKind::Account
                | EntityKind::CalendarResource
                | EntityKind::DistributionList
                | EntityKind::Alias
        )
    }

    pub fn is_group(&self) -> bool {
        matches!(self, EntityKind::DistributionList)
    }

    /// Calendar resources are accounts with extra scheduling attributes
    pub fn is_account(&self) -> bool {
        matches!(self, EntityKind::Account | EntityKind::CalendarResource)
    }
}

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Locked,
    Lockout,
    Maintenance,
    Pending,
    Closed,
}

impl AccountStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "locked" => Some(AccountStatus::Locked),
            "lockout" => Some(AccountStatus::Lockout),
            "maintenance" => Some(AccountStatus::Maintenance),
            "pending" => Some(AccountStatus::Pending),
            "closed" => Some(AccountStatus::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Locked => "locked",
            AccountStatus::Lockout => "lockout",
            AccountStatus::Maintenance => "maintenance",
            AccountStatus::Pending => "pending",
            AccountStatus::Closed => "closed",
        }
    }
}

/// Domain type: local domains host entries, alias domains redirect addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainType {
    Local,
    Alias,
}

/// A directory-backed identity object
///
/// The id never changes across rename; the name and distinguished name may
/// change together. Callers must treat a cached entity as immutable and go
/// through the modify path for every attribute change.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub dn: String,
    pub kind: EntityKind,
    pub attrs: AttrMap,
}

impl Entity {
    /// Construct a typed entity from a raw directory entry.
    ///
    /// The unique name is derived per kind: address-bearing entities use
    /// `mail`, domains use the domain name attribute, servers and classes of
    /// service use `cn`.
    pub fn from_entry(dn: String, attrs: AttrMap) -> Result<Self> {
        let kind = EntityKind::from_object_classes(attrs.get_all(names::A_OBJECT_CLASS))
            .ok_or_else(|| {
                AppError::InvalidInput(format!("entry {dn} has no recognized object class"))
            })?;

        let id = attrs
            .get(names::A_PROVIS_ID)
            .ok_or_else(|| AppError::InvalidInput(format!("entry {dn} is missing an id")))
            .and_then(|raw| {
                Uuid::parse_str(raw)
                    .map_err(|_| AppError::InvalidInput(format!("entry {dn} has a malformed id")))
            })?;

        let name_attr = match kind {
            EntityKind::Domain => names::A_DOMAIN_NAME,
            EntityKind::Cos | EntityKind::Server | EntityKind::XmppComponent => names::A_CN,
            _ => names::A_MAIL,
        };
        let name = attrs
            .get(name_attr)
            .ok_or_else(|| {
                AppError::InvalidInput(format!("entry {dn} is missing its {name_attr} name"))
            })?
            .to_string();

        Ok(Entity {
            id,
            name,
            dn,
            kind,
            attrs,
        })
    }

    /// Primary address plus all alias addresses, for address-bearing kinds
    pub fn addresses(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.kind.has_address() {
            out.push(self.name.clone());
            for alias in self.attrs.get_all(names::A_MAIL_ALIAS) {
                if !alias.eq_ignore_ascii_case(&self.name) {
                    out.push(alias.clone());
                }
            }
        }
        out
    }

    /// Every name this entity may be looked up under: primary name,
    /// aliases, foreign principals, and (for domains) the externally
    /// supplied secondary keys
    pub fn cache_keys(&self) -> Vec<String> {
        let mut keys = self.addresses();
        if !keys.iter().any(|k| k.eq_ignore_ascii_case(&self.name)) {
            keys.push(self.name.clone());
        }
        for principal in self.attrs.get_all(names::A_FOREIGN_PRINCIPAL) {
            keys.push(principal.clone());
        }
        if self.kind == EntityKind::Domain {
            for attr in [
                names::A_VIRTUAL_HOSTNAME,
                names::A_FOREIGN_NAME,
                names::A_KRB5_REALM,
            ] {
                for value in self.attrs.get_all(attr) {
                    keys.push(value.clone());
                }
            }
        }
        keys
    }

    pub fn local_part(&self) -> Option<&str> {
        self.name.split_once('@').map(|(l, _)| l)
    }

    pub fn domain_part(&self) -> Option<&str> {
        self.name.split_once('@').map(|(_, d)| d)
    }

    pub fn status(&self) -> AccountStatus {
        self.attrs
            .get(names::A_ACCOUNT_STATUS)
            .and_then(AccountStatus::from_str)
            .unwrap_or(AccountStatus::Active)
    }

    pub fn domain_type(&self) -> DomainType {
        match self.attrs.get(names::A_DOMAIN_TYPE) {
            Some("alias") => DomainType::Alias,
            _ => DomainType::Local,
        }
    }

    /// For alias-type domains, the id of the domain they point at
    pub fn alias_target_domain(&self) -> Option<Uuid> {
        self.attrs
            .get(names::A_DOMAIN_ALIAS_TARGET_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }

    pub fn is_admin_group(&self) -> bool {
        self.kind.is_group() && self.attrs.get_bool(names::A_IS_ADMIN_GROUP).unwrap_or(false)
    }

    /// Copy of this group without its member list, for the access-control
    /// group cache where the member list would dominate memory
    pub fn without_members(&self) -> Entity {
        let mut trimmed = self.clone();
        trimmed.attrs.remove(names::A_LIST_MEMBER);
        trimmed
    }
}
