//! SHA256 hashing for stored credentials and tokens.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Compute SHA256 hash of data as lowercase hex.
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stored password form: SHA256 of `username:password`.
pub fn password_hash(username: &str, password: &str) -> String {
    sha256(format!("{}:{}", username, password).as_bytes())
}

/// Check a password against its stored hash in constant time.
pub fn verify_password(username: &str, password: &str, stored: &str) -> bool {
    let computed = password_hash(username, password);
    computed.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Only the hash of a token is ever persisted.
pub fn token_hash(token: &str) -> String {
    sha256(token.as_bytes())
}

/// Fresh opaque bearer token.
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn password_hash_binds_username() {
        assert_eq!(password_hash("alice", "secret"), sha256(b"alice:secret"));
        assert_ne!(password_hash("alice", "secret"), password_hash("bob", "secret"));
    }

    #[test]
    fn verify_password_matches_stored_hash_only() {
        let stored = password_hash("alice", "secret");
        assert!(verify_password("alice", "secret", &stored));
        assert!(!verify_password("alice", "Secret", &stored));
        assert!(!verify_password("bob", "secret", &stored));
        assert!(!verify_password("alice", "secret", &stored[..63]));
        assert!(!verify_password("alice", "secret", ""));
    }

    #[test]
    fn tokens_are_unique_and_hashed() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(token_hash(&a).len(), 64);
        assert_ne!(token_hash(&a), a);
    }
}
