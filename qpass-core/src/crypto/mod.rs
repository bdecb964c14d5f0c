//! Cryptographic primitives for qpass.
//!
//! This module provides:
//! - Argon2id key derivation for account and session keys
//! - AES-256-GCM sealing in the `nonce || ciphertext || tag` layout
//! - Auth token derivation and constant-time comparison

pub mod cipher;
pub mod kdf;
pub mod token;

pub use cipher::{open, seal, SecretKey, MIN_SEALED_LEN};
pub use kdf::{derive_account_key, derive_key, KdfParams};
pub use token::{client_auth_token, server_token_hash, tokens_match};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
