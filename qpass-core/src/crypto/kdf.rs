//! Argon2id key derivation.
//!
//! Two keys come out of here:
//! - the account key, derived from the password with `SHA-256(username)` as salt
//! - the per-connection session key, derived from the X25519 shared secret
//!
//! Default parameters (interactive):
//! - Memory cost: 64 MiB (65,536 KiB)
//! - Time cost: 3 iterations
//! - Parallelism: 2 lanes
//! - Output length: 32 bytes

use crate::crypto::{CryptoError, Result, SecretKey};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,

    /// Output length in bytes
    pub output_length: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

impl KdfParams {
    pub fn interactive() -> Self {
        Self {
            mem_cost: 65_536,
            time_cost: 3,
            parallelism: 2,
            output_length: 32,
        }
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        if self.mem_cost < 8 * self.parallelism {
            return Err(CryptoError::KdfFailed(format!(
                "Memory cost too low (minimum: {} KiB for {} lanes)",
                8 * self.parallelism,
                self.parallelism
            )));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.output_length != 32 {
            return Err(CryptoError::KdfFailed(format!(
                "Output length must be 32 bytes, got {}",
                self.output_length
            )));
        }
        Ok(())
    }
}

/// Derive a 32-byte key from `secret` and `salt` with Argon2id.
///
/// The salt must be at least 8 bytes long.
pub fn derive_key(secret: &[u8], salt: &[u8], params: &KdfParams) -> Result<SecretKey> {
    params.validate()?;

    let params_obj = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(params.output_length as usize),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params_obj);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(secret, salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let key = SecretKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

/// Derive the account key for `username` / `password`.
///
/// The salt is `SHA-256(username)`, so every device holding the same
/// credentials arrives at the same key without storing a salt remotely.
pub fn derive_account_key(username: &str, password: &str, params: &KdfParams) -> Result<SecretKey> {
    let salt = Sha256::digest(username.as_bytes());
    derive_key(password.as_bytes(), &salt, params)
}

#[cfg(test)]
pub(crate) fn test_params() -> KdfParams {
    KdfParams {
        mem_cost: 256,
        time_cost: 1,
        parallelism: 1,
        output_length: 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_params_default() {
        let params = KdfParams::default();
        assert_eq!(params.mem_cost, 65_536);
        assert_eq!(params.time_cost, 3);
        assert_eq!(params.parallelism, 2);
        assert_eq!(params.output_length, 32);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_kdf_params_validation() {
        let mut params = test_params();
        assert!(params.validate().is_ok());

        params.parallelism = 0;
        assert!(params.validate().is_err());

        params.parallelism = 4;
        params.mem_cost = 16;
        assert!(params.validate().is_err());

        params.mem_cost = 256;
        params.time_cost = 0;
        assert!(params.validate().is_err());

        params.time_cost = 1;
        params.output_length = 16;
        assert!(params.validate().is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let params = test_params();
        let a = derive_key(b"shared secret", b"saltsalt", &params).unwrap();
        let b = derive_key(b"shared secret", b"saltsalt", &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn salt_changes_output() {
        let params = test_params();
        let a = derive_key(b"shared secret", b"saltsalt", &params).unwrap();
        let b = derive_key(b"shared secret", b"SALTSALT", &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn short_salt_rejected() {
        assert!(derive_key(b"secret", b"short", &test_params()).is_err());
    }

    #[test]
    fn account_key_depends_on_username() {
        let params = test_params();
        let alice = derive_account_key("alice", "hunter2", &params).unwrap();
        let again = derive_account_key("alice", "hunter2", &params).unwrap();
        let bob = derive_account_key("bob", "hunter2", &params).unwrap();

        assert_eq!(alice.as_bytes(), again.as_bytes());
        assert_ne!(alice.as_bytes(), bob.as_bytes());
    }

    #[test]
    fn single_character_username_works() {
        assert!(derive_account_key("u", "p", &test_params()).is_ok());
    }
}
