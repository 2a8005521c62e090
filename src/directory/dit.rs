//! Directory information tree layout
//!
//! Maps entity names to distinguished names. The directory owns every DN it
//! hands back; the engine only computes DNs here, at creation and rename
//! time, and treats every other DN as opaque.

use crate::directory::dn;

/// DN layout rooted at a configurable base
#[derive(Debug, Clone)]
pub struct Dit {
    base: String,
}

impl Dit {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dn(&self) -> &str {
        &self.base
    }

    /// `example.com` -> `dc=example,dc=com,<base>`
    pub fn domain_dn(&self, domain_name: &str) -> String {
        let components: Vec<String> = domain_name
            .split('.')
            .map(|label| format!("dc={}", dn::escape_rdn_value(label)))
            .collect();
        format!("{},{}", components.join(","), self.base)
    }

    /// Container for the accounts, lists, and aliases of a domain
    pub fn people_dn(&self, domain_dn: &str) -> String {
        format!("ou=people,{domain_dn}")
    }

    /// DN for any address-bearing entry: `local@domain`
    pub fn address_dn(&self, local_part: &str, domain_name: &str) -> String {
        format!(
            "uid={},{}",
            dn::escape_rdn_value(local_part),
            self.people_dn(&self.domain_dn(domain_name))
        )
    }

    pub fn cos_dn(&self, name: &str) -> String {
        format!("cn={},cn=cos,{}", dn::escape_rdn_value(name), self.base)
    }

    pub fn server_dn(&self, name: &str) -> String {
        format!("cn={},cn=servers,{}", dn::escape_rdn_value(name), self.base)
    }

    pub fn xmpp_component_dn(&self, name: &str) -> String {
        format!(
            "cn={},cn=xmppcomponents,{}",
            dn::escape_rdn_value(name),
            self.base
        )
    }

    /// The lazily-loaded global configuration entry
    pub fn global_config_dn(&self) -> String {
        format!("cn=config,{}", self.base)
    }

    /// The global grant entry consulted by the rights engine
    pub fn global_grant_dn(&self) -> String {
        format!("cn=globalgrant,{}", self.base)
    }
}
