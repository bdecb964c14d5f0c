//! The server's long-term RSA identity.
//!
//! Stored as two PKCS#1 PEM files in the key directory: `key.rsa` (private,
//! mode 0600 on unix) and `key.rsa.pub`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::pss::{BlindedSigningKey, Signature, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::info;

use crate::channel::{fingerprint, ChannelError};

pub const PRIVATE_KEY_FILE: &str = "key.rsa";
pub const PUBLIC_KEY_FILE: &str = "key.rsa.pub";
pub const DEFAULT_RSA_BITS: usize = 4096;

pub struct ServerIdentity {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_der: Vec<u8>,
}

impl ServerIdentity {
    pub fn from_private_key(private: RsaPrivateKey) -> Result<Self, ChannelError> {
        let public = private.to_public_key();
        let public_der = public
            .to_pkcs1_der()
            .map_err(|e| ChannelError::Identity(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public,
            public_der,
        })
    }

    /// Generate a fresh key pair. Slow for 4096-bit keys; call off the
    /// async executor.
    pub fn generate(bits: usize) -> Result<Self, ChannelError> {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| ChannelError::Identity(e.to_string()))?;
        Self::from_private_key(private)
    }

    /// Load `key.rsa` from `dir`, or generate and write a new pair.
    pub fn load_or_generate(dir: &Path, bits: usize) -> Result<Self, ChannelError> {
        let private_path = dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            let pem = fs::read_to_string(&private_path)?;
            let private = RsaPrivateKey::from_pkcs1_pem(&pem)
                .map_err(|e| ChannelError::Identity(format!("{}: {}", private_path.display(), e)))?;
            let identity = Self::from_private_key(private)?;
            info!(
                path = %private_path.display(),
                fingerprint = %fingerprint(&identity.public),
                "Loaded server key"
            );
            return Ok(identity);
        }

        info!(bits, dir = %dir.display(), "Generating server key");
        let identity = Self::generate(bits)?;
        identity.save(dir)?;
        info!(fingerprint = %fingerprint(&identity.public), "Server key written");
        Ok(identity)
    }

    /// Write the key pair into `dir`. An existing private key is never
    /// overwritten.
    pub fn save(&self, dir: &Path) -> Result<(), ChannelError> {
        fs::create_dir_all(dir)?;

        let private_pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ChannelError::Identity(e.to_string()))?;
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(dir.join(PRIVATE_KEY_FILE))?;
        file.write_all(private_pem.as_bytes())?;
        file.sync_all()?;

        let public_pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| ChannelError::Identity(e.to_string()))?;
        fs::write(dir.join(PUBLIC_KEY_FILE), public_pem)?;
        Ok(())
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// PKCS#1 DER encoding of the public key, as sent in the handshake.
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    /// RSA-PSS / SHA-256 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signing_key = BlindedSigningKey::<Sha256>::new(self.private.clone());
        signing_key.sign_with_rng(&mut OsRng, message).to_vec()
    }
}

/// Check an RSA-PSS / SHA-256 signature made by [`ServerIdentity::sign`].
pub fn verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), ChannelError> {
    let signature = Signature::try_from(signature).map_err(|_| ChannelError::BadSignature)?;
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(message, &signature)
        .map_err(|_| ChannelError::BadSignature)
}

/// Read a PEM public key written by [`ServerIdentity::save`].
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, ChannelError> {
    let pem = fs::read_to_string(path)?;
    RsaPublicKey::from_pkcs1_pem(&pem).map_err(|e| ChannelError::Identity(e.to_string()))
}
