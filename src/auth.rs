//! Worker credentials and admin token checks.
//!
//! A credential is 32 random bytes, hex encoded. Only its SHA-256 digest is
//! stored; the plaintext is handed to the worker once at registration.

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Mint a new opaque worker credential.
pub fn generate_credential() -> SecretString {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretString::from(hex::encode(bytes))
}

/// Digest stored in place of the credential.
pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Compare a presented admin token against the configured one by digest.
pub fn admin_token_matches(presented: &str, expected: &SecretString) -> bool {
    hash_credential(presented) == hash_credential(expected.expose_secret())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_unique_hex() {
        let a = generate_credential();
        let b = generate_credential();
        assert_eq!(a.expose_secret().len(), 64);
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn hash_is_stable_and_not_the_plaintext() {
        let hash = hash_credential("secret");
        assert_eq!(hash, hash_credential("secret"));
        assert_ne!(hash, "secret");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer   "), None);
    }

    #[test]
    fn admin_token_comparison() {
        let expected = SecretString::from("dev-admin-token");
        assert!(admin_token_matches("dev-admin-token", &expected));
        assert!(!admin_token_matches("wrong", &expected));
    }
}
