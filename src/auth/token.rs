use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const KEY_PREFIX: &str = "aw_sk_";

const SECRET_LENGTH: usize = 43; // 43 base62 chars > 32 bytes of entropy
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Mint a new API key. Returns `(plaintext, hash)`; only the hash is ever
/// stored, so the plaintext can be shown exactly once.
pub fn generate_api_key() -> (String, String) {
    let mut rng = rand::thread_rng();
    let mut secret = String::with_capacity(KEY_PREFIX.len() + SECRET_LENGTH);
    secret.push_str(KEY_PREFIX);
    for _ in 0..SECRET_LENGTH {
        secret.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    let hash = hash_api_key(&secret);
    (secret, hash)
}

/// SHA-256 hex of the full token; lookups go through this hash.
pub fn hash_api_key(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Extract the raw key from an `Authorization: Bearer aw_sk_...` header.
pub fn parse_bearer(header: &str) -> Result<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(Error::Unauthenticated)?
        .trim();
    if !token.starts_with(KEY_PREFIX) || token.len() < KEY_PREFIX.len() + 32 {
        return Err(Error::Unauthenticated);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_expected_shape() {
        let (plaintext, hash) = generate_api_key();
        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + SECRET_LENGTH);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key(&plaintext));
    }

    #[test]
    fn keys_are_unique() {
        let (a, _) = generate_api_key();
        let (b, _) = generate_api_key();
        assert_ne!(a, b);
    }

    #[test]
    fn bearer_parsing() {
        let (plaintext, _) = generate_api_key();
        let header = format!("Bearer {plaintext}");
        assert_eq!(parse_bearer(&header).unwrap(), plaintext);

        assert!(parse_bearer("Basic abc").is_err());
        assert!(parse_bearer("Bearer short").is_err());
        assert!(parse_bearer("Bearer wrong_prefix_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").is_err());
    }
}
