//! Cryptographic utilities for Provis Core

pub mod preauth;

pub use preauth::{compute_preauth, generate_preauth_key, PreAuthParams};

use crate::error::{AppError, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("password hashing failed: {e}")))
}

/// Verify a password against a stored salted hash.
///
/// Entries written by this engine carry PHC-format argon2 hashes; entries
/// imported from other directories may carry the salted-SHA schemes
/// (`{SSHA}`, `{SSHA256}`), which remain verifiable but are never written.
///
/// A malformed stored hash is an internal error, not a failed verification;
/// the two must stay distinguishable for the auth fallback decision.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    if let Some(encoded) = stored.strip_prefix("{SSHA}") {
        return verify_salted_digest::<Sha1>(password, encoded, 20);
    }
    if let Some(encoded) = stored.strip_prefix("{SSHA256}") {
        return verify_salted_digest::<Sha256>(password, encoded, 32);
    }
    let parsed = PasswordHash::new(stored)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stored hash is malformed: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Salted-digest check: base64 payload is digest followed by salt
fn verify_salted_digest<D: Digest>(
    password: &str,
    encoded: &str,
    digest_len: usize,
) -> Result<bool> {
    let decoded = BASE64
        .decode(encoded)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("stored hash is malformed: {e}")))?;
    if decoded.len() < digest_len {
        return Err(AppError::Internal(anyhow::anyhow!(
            "stored hash is truncated"
        )));
    }
    let (digest, salt) = decoded.split_at(digest_len);
    let mut hasher = D::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    Ok(hasher.finalize().as_slice() == digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify_roundtrip() {
        let hash = hash_password("s3cret!").unwrap();
        assert!(verify_password("s3cret!", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let first = hash_password("same-password").unwrap();
        let second = hash_password("same-password").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_malformed_stored_hash_is_internal_error() {
        assert!(verify_password("pw", "not-a-hash").is_err());
    }

    #[test]
    fn test_imported_ssha_hashes_verify() {
        // {SSHA} of "secret" with salt "salty": sha1(secret || salty) ++ salty
        let mut hasher = Sha1::new();
        hasher.update(b"secret");
        hasher.update(b"salty");
        let mut payload = hasher.finalize().to_vec();
        payload.extend_from_slice(b"salty");
        let stored = format!("{{SSHA}}{}", BASE64.encode(&payload));

        assert!(verify_password("secret", &stored).unwrap());
        assert!(!verify_password("wrong", &stored).unwrap());
    }

    #[test]
    fn test_imported_ssha256_hashes_verify() {
        let mut hasher = Sha256::new();
        hasher.update(b"secret");
        hasher.update(b"pepper");
        let mut payload = hasher.finalize().to_vec();
        payload.extend_from_slice(b"pepper");
        let stored = format!("{{SSHA256}}{}", BASE64.encode(&payload));

        assert!(verify_password("secret", &stored).unwrap());
        assert!(!verify_password("wrong", &stored).unwrap());
    }
}
