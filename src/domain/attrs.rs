//! Attribute names and the attribute map shared by every directory entity

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known attribute names.
///
/// The directory schema owns these; the engine never invents attribute names
/// outside this list plus whatever the caller passes through verbatim.
pub mod names {
    pub const A_OBJECT_CLASS: &str = "objectClass";
    pub const A_PROVIS_ID: &str = "provisId";
    pub const A_UID: &str = "uid";
    pub const A_CN: &str = "cn";
    pub const A_MAIL: &str = "mail";
    pub const A_MAIL_ALIAS: &str = "provisMailAlias";
    pub const A_LIST_MEMBER: &str = "provisListMember";
    pub const A_ALIAS_TARGET_ID: &str = "provisAliasTargetId";
    pub const A_ACCOUNT_STATUS: &str = "provisAccountStatus";
    pub const A_COS_ID: &str = "provisCosId";
    pub const A_DOMAIN_NAME: &str = "provisDomainName";
    pub const A_DOMAIN_TYPE: &str = "provisDomainType";
    pub const A_DOMAIN_ALIAS_TARGET_ID: &str = "provisDomainAliasTargetId";
    pub const A_DOMAIN_DEFAULT_COS_ID: &str = "provisDomainDefaultCosId";
    pub const A_VIRTUAL_HOSTNAME: &str = "provisVirtualHostname";
    pub const A_FOREIGN_NAME: &str = "provisForeignName";
    pub const A_FOREIGN_PRINCIPAL: &str = "provisForeignPrincipal";
    pub const A_KRB5_REALM: &str = "provisAuthKerberos5Realm";
    pub const A_IS_ADMIN_GROUP: &str = "provisIsAdminGroup";
    pub const A_IS_ADMIN_ACCOUNT: &str = "provisIsAdminAccount";
    pub const A_ADMIN_NAME: &str = "provisAdminName";
    pub const A_PASSWORD: &str = "userPassword";
    pub const A_AUTH_MECH: &str = "provisAuthMech";
    pub const A_AUTH_FALLBACK: &str = "provisAuthFallbackToLocal";
    pub const A_AUTH_LDAP_URL: &str = "provisAuthLdapURL";
    pub const A_AUTH_LDAP_BIND_DN: &str = "provisAuthLdapBindDn";
    pub const A_AUTH_LDAP_SEARCH_BASE: &str = "provisAuthLdapSearchBase";
    pub const A_AUTH_LDAP_SEARCH_FILTER: &str = "provisAuthLdapSearchFilter";
    pub const A_PREAUTH_KEY: &str = "provisPreAuthKey";
    pub const A_PASSWORD_MODIFIED_TIME: &str = "provisPasswordModifiedTime";
    pub const A_PASSWORD_MUST_CHANGE: &str = "provisPasswordMustChange";
    pub const A_PASSWORD_HISTORY: &str = "provisPasswordHistory";
    pub const A_PASSWORD_LOCKOUT_TIME: &str = "provisPasswordLockoutLockedTime";
    pub const A_PASSWORD_FAILURE_TIME: &str = "provisPasswordLockoutFailureTime";
    pub const A_AUTH_TOKEN_VALIDITY: &str = "provisAuthTokenValidityValue";
    pub const A_COMPONENT_DOMAIN: &str = "provisComponentDomain";
    pub const A_GAL_MODE: &str = "provisGalMode";
    pub const A_GAL_MAX_RESULTS: &str = "provisGalMaxResults";
    pub const A_CONTACT_TYPE: &str = "provisContactType";
    pub const A_MODIFIED_TIMESTAMP: &str = "modifyTimestamp";
}

/// Attribute map of a directory entity: name to one or more string values.
///
/// Multi-valued attributes keep their directory order. Lookups are
/// case-sensitive on the attribute name (names are normalized at the schema
/// boundary), value comparisons for addresses are not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttrMap(BTreeMap<String, Vec<String>>);

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value of an attribute, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(|s| s.as_str())
    }

    /// All values of an attribute; empty slice when absent
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Directory-style boolean: TRUE / FALSE, case-insensitive
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).map(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_string(), vec![value.into()]);
    }

    pub fn set_multi(&mut self, name: &str, values: Vec<String>) {
        if values.is_empty() {
            self.0.remove(name);
        } else {
            self.0.insert(name.to_string(), values);
        }
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.set(name, if value { "TRUE" } else { "FALSE" });
    }

    /// Append a value, skipping case-insensitive duplicates
    pub fn add_value(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.0.entry(name.to_string()).or_default();
        if !values.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
            values.push(value);
        }
    }

    /// Remove a single value; drops the attribute when the last value goes
    pub fn remove_value(&mut self, name: &str, value: &str) {
        if let Some(values) = self.0.get_mut(name) {
            values.retain(|v| !v.eq_ignore_ascii_case(value));
            if values.is_empty() {
                self.0.remove(name);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(name)
    }

    /// Case-insensitive membership test, used for address lists
    pub fn contains_value(&self, name: &str, value: &str) -> bool {
        self.get_all(name)
            .iter()
            .any(|v| v.eq_ignore_ascii_case(value))
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` over `self`, keeping existing values on conflict.
    ///
    /// Used for COS and domain default inheritance: the entity's own values
    /// always win over inherited defaults.
    pub fn merge_defaults(&mut self, other: &AttrMap) {
        for (name, values) in other.iter() {
            if !self.0.contains_key(name) {
                self.0.insert(name.clone(), values.clone());
            }
        }
    }
}

impl FromIterator<(String, Vec<String>)> for AttrMap {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        AttrMap(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_and_multi_values() {
        let mut attrs = AttrMap::new();
        attrs.set(names::A_MAIL, "user@example.com");
        attrs.add_value(names::A_MAIL_ALIAS, "a@example.com");
        attrs.add_value(names::A_MAIL_ALIAS, "b@example.com");

        assert_eq!(attrs.get(names::A_MAIL), Some("user@example.com"));
        assert_eq!(attrs.get_all(names::A_MAIL_ALIAS).len(), 2);
    }

    #[test]
    fn test_add_value_deduplicates_case_insensitively() {
        let mut attrs = AttrMap::new();
        attrs.add_value(names::A_MAIL_ALIAS, "A@Example.Com");
        attrs.add_value(names::A_MAIL_ALIAS, "a@example.com");
        assert_eq!(attrs.get_all(names::A_MAIL_ALIAS).len(), 1);
    }

    #[test]
    fn test_remove_last_value_drops_attribute() {
        let mut attrs = AttrMap::new();
        attrs.set(names::A_MAIL_ALIAS, "a@example.com");
        attrs.remove_value(names::A_MAIL_ALIAS, "A@EXAMPLE.COM");
        assert!(!attrs.contains_key(names::A_MAIL_ALIAS));
    }

    #[test]
    fn test_directory_booleans() {
        let mut attrs = AttrMap::new();
        attrs.set_bool(names::A_IS_ADMIN_GROUP, true);
        assert_eq!(attrs.get(names::A_IS_ADMIN_GROUP), Some("TRUE"));
        assert_eq!(attrs.get_bool(names::A_IS_ADMIN_GROUP), Some(true));
    }

    #[test]
    fn test_merge_defaults_keeps_own_values() {
        let mut attrs = AttrMap::new();
        attrs.set("quota", "100");

        let mut defaults = AttrMap::new();
        defaults.set("quota", "50");
        defaults.set("theme", "light");

        attrs.merge_defaults(&defaults);
        assert_eq!(attrs.get("quota"), Some("100"));
        assert_eq!(attrs.get("theme"), Some("light"));
    }
}
