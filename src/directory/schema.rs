//! Attribute schema metadata collaborator
//!
//! The directory schema decides which attributes carry binary data, which
//! need a binary-safe transfer encoding, and which may never be rewritten.
//! The engine consults this before every write and every value decode; the
//! real server wires in a schema built from directory introspection, while
//! [`StaticSchema`] covers the attributes this crate itself touches.

use std::collections::HashSet;

/// Schema queries the engine needs before directory writes and decodes
pub trait AttrSchema: Send + Sync {
    /// Attribute values are raw bytes, not UTF-8 strings
    fn is_binary(&self, attr: &str) -> bool;

    /// Attribute must be transferred with the binary option even though its
    /// values may look like text
    fn needs_binary_transfer(&self, attr: &str) -> bool;

    /// Attribute may never be modified after creation
    fn is_immutable(&self, attr: &str) -> bool;
}

/// Fixed schema table for the engine's own attributes
pub struct StaticSchema {
    binary: HashSet<&'static str>,
    binary_transfer: HashSet<&'static str>,
    immutable: HashSet<&'static str>,
}

impl Default for StaticSchema {
    fn default() -> Self {
        Self {
            binary: ["userSMIMECertificate", "provisPrefMailSMIMECertificate"]
                .into_iter()
                .collect(),
            binary_transfer: ["userCertificate"].into_iter().collect(),
            immutable: [
                crate::domain::names::A_PROVIS_ID,
                "createTimestamp",
                "modifyTimestamp",
                "entryUUID",
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttrSchema for StaticSchema {
    fn is_binary(&self, attr: &str) -> bool {
        self.binary.contains(attr)
    }

    fn needs_binary_transfer(&self, attr: &str) -> bool {
        self.binary.contains(attr) || self.binary_transfer.contains(attr)
    }

    fn is_immutable(&self, attr: &str) -> bool {
        self.immutable.contains(attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::names;

    #[test]
    fn test_id_is_immutable() {
        let schema = StaticSchema::new();
        assert!(schema.is_immutable(names::A_PROVIS_ID));
        assert!(!schema.is_immutable(names::A_MAIL));
    }

    #[test]
    fn test_binary_implies_binary_transfer() {
        let schema = StaticSchema::new();
        assert!(schema.is_binary("userSMIMECertificate"));
        assert!(schema.needs_binary_transfer("userSMIMECertificate"));
        assert!(schema.needs_binary_transfer("userCertificate"));
        assert!(!schema.is_binary("userCertificate"));
    }
}
