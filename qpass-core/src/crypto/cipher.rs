//! AES-256-GCM sealing for record fields, usernames and channel records.
//!
//! Sealed layout: `nonce(12) || ciphertext || auth_tag(16)`. Every call to
//! [`seal`] draws a fresh random nonce.

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Smallest possible sealed blob (empty plaintext).
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

/// A 256-bit symmetric key. Used both for account keys and session keys.
///
/// The key bytes are wiped when the value is dropped.
#[derive(Clone)]
pub struct SecretKey {
    key: [u8; 32],
}

impl SecretKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { key: key.into() }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Build a key from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Seal `plaintext` under `key`.
///
/// Returns `nonce(12) || ciphertext || auth_tag(16)`. Empty plaintext is
/// allowed and seals to exactly [`MIN_SEALED_LEN`] bytes.
pub fn seal(key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    // aes-gcm appends the tag, so this is ciphertext || tag
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a blob produced by [`seal`].
///
/// Any tampering, truncation or wrong key yields
/// [`CryptoError::AuthenticationFailed`].
pub fn open(key: &SecretKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::DecryptionFailed(format!(
            "sealed blob too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Seal a UTF-8 string.
pub fn seal_str(key: &SecretKey, plaintext: &str) -> Result<Vec<u8>> {
    seal(key, plaintext.as_bytes())
}

/// Open a blob and interpret it as UTF-8.
pub fn open_str(key: &SecretKey, sealed: &[u8]) -> Result<String> {
    let bytes = open(key, sealed)?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid UTF-8: {}", e)))
}
