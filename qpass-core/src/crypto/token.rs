//! Authentication tokens.
//!
//! The client never sends its account key. It sends
//! `HKDF-SHA256(ikm = account key, salt = password, info = "qpass-auth-token-v1")`,
//! and the server only ever stores `SHA-256(token)`.

use crate::crypto::{CryptoError, Result, SecretKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_INFO: &[u8] = b"qpass-auth-token-v1";

pub const TOKEN_LEN: usize = 32;

/// Token presented by the client in AUTH and NUSR.
pub fn client_auth_token(key: &SecretKey, password: &str) -> Result<[u8; TOKEN_LEN]> {
    let hk = Hkdf::<Sha256>::new(Some(password.as_bytes()), key.as_bytes());
    let mut token = [0u8; TOKEN_LEN];
    hk.expand(TOKEN_INFO, &mut token)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(token)
}

/// What the server stores and looks up for a presented token.
pub fn server_token_hash(token: &[u8]) -> [u8; 32] {
    Sha256::digest(token).into()
}

/// Constant-time equality for token material.
pub fn tokens_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_deterministic_and_password_bound() {
        let key = SecretKey::from_bytes([9u8; 32]);
        let a = client_auth_token(&key, "p").unwrap();
        let b = client_auth_token(&key, "p").unwrap();
        let c = client_auth_token(&key, "q").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(&a, key.as_bytes());
    }

    #[test]
    fn server_hash_differs_from_token() {
        let token = client_auth_token(&SecretKey::from_bytes([1u8; 32]), "p").unwrap();
        let hash = server_token_hash(&token);
        assert_ne!(hash, token);
        assert_eq!(hash, server_token_hash(&token));
    }

    #[test]
    fn tokens_match_compares_length_and_content() {
        assert!(tokens_match(b"abc", b"abc"));
        assert!(!tokens_match(b"abc", b"abd"));
        assert!(!tokens_match(b"abc", b"abcd"));
    }
}
