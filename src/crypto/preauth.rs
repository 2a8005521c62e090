//! Pre-authentication signatures
//!
//! A preauth token lets a trusted portal sign a user into the server
//! without ever presenting the password: the portal computes an
//! HMAC-SHA1 over the request parameters with a per-domain shared key,
//! and the engine recomputes and compares. The signed string is the
//! parameter values joined with `|` in sorted-key order, so both sides
//! agree on ordering without transmitting it.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

/// The canonical preauth parameter set
#[derive(Debug, Clone)]
pub struct PreAuthParams {
    /// Account identifier as supplied by the caller (name, id, or foreign
    /// principal, per `by`)
    pub account: String,
    /// Which kind of identifier `account` carries
    pub by: String,
    /// Caller's clock, milliseconds since the epoch
    pub timestamp_ms: i64,
    /// Requested expiry in milliseconds since the epoch; 0 leaves the
    /// lifetime to server policy
    pub expires_ms: i64,
}

impl PreAuthParams {
    fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("account".to_string(), self.account.clone()),
            ("by".to_string(), self.by.clone()),
            ("timestamp".to_string(), self.timestamp_ms.to_string()),
            ("expires".to_string(), self.expires_ms.to_string()),
        ])
    }

    /// Sign these parameters with the domain's shared key
    pub fn sign(&self, key: &str) -> String {
        compute_preauth(&self.to_map(), key)
    }
}

/// HMAC-SHA1 over parameter values joined with `|` in sorted-key order,
/// rendered as lowercase hex
pub fn compute_preauth(params: &BTreeMap<String, String>, key: &str) -> String {
    let data = params
        .values()
        .cloned()
        .collect::<Vec<_>>()
        .join("|");
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Generate a fresh random preauth key for a domain
pub fn generate_preauth_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison of two hex signatures
pub fn signatures_match(left: &str, right: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.bytes()
        .zip(right.bytes())
        .fold(0u8, |acc, (l, r)| acc | (l ^ r))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_key_dependent() {
        let params = PreAuthParams {
            account: "user@example.com".to_string(),
            by: "name".to_string(),
            timestamp_ms: 1_700_000_000_000,
            expires_ms: 0,
        };
        let first = params.sign("key-one");
        let second = params.sign("key-one");
        let other = params.sign("key-two");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 40); // sha1 hex
    }

    #[test]
    fn test_sorted_key_order_matters() {
        // "account" < "by" < "expires" < "timestamp": the signed string is
        // account|by|expires|timestamp regardless of insertion order
        let mut params = BTreeMap::new();
        params.insert("timestamp".to_string(), "1".to_string());
        params.insert("account".to_string(), "a@x.com".to_string());
        params.insert("expires".to_string(), "0".to_string());
        params.insert("by".to_string(), "name".to_string());

        let mut reordered = BTreeMap::new();
        reordered.insert("account".to_string(), "a@x.com".to_string());
        reordered.insert("by".to_string(), "name".to_string());
        reordered.insert("expires".to_string(), "0".to_string());
        reordered.insert("timestamp".to_string(), "1".to_string());

        assert_eq!(
            compute_preauth(&params, "k"),
            compute_preauth(&reordered, "k")
        );
    }

    #[test]
    fn test_generated_keys_are_unique() {
        assert_ne!(generate_preauth_key(), generate_preauth_key());
    }

    #[test]
    fn test_signatures_match_rejects_prefix() {
        assert!(signatures_match("abcd", "abcd"));
        assert!(!signatures_match("abcd", "abce"));
        assert!(!signatures_match("abcd", "abc"));
    }
}
