//! Secure channel.
//!
//! A client and server agree on a per-connection session key with an
//! ephemeral X25519 exchange, stretched through Argon2id. The server proves
//! its long-term identity with an RSA-PSS signature over the exchange and
//! confirms the session key with a sealed MAC. After the handshake every
//! write becomes one length-prefixed AES-256-GCM record.
//!
//! The rest of the crate only sees [`SecureChannel`] as an
//! `AsyncRead + AsyncWrite` stream.

pub mod handshake;
pub mod identity;
pub mod known_hosts;
pub mod record;

pub use handshake::{client_handshake, server_handshake};
pub use identity::ServerIdentity;
pub use known_hosts::{fingerprint, FileKnownHosts, KnownHosts, MemoryKnownHosts};
pub use record::{SecureChannel, MAX_RECORD_PLAINTEXT};

use crate::crypto::CryptoError;
use std::io;
use thiserror::Error;

/// Log target for cryptographic and trust failures.
pub const SECURITY_TARGET: &str = "qpass::security";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("key derivation failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("key exchange produced a non-contributory shared secret")]
    NonContributory,

    #[error("server sent an invalid public key: {0}")]
    InvalidServerKey(String),

    #[error("handshake field {field} too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("server signature did not verify")]
    BadSignature,

    #[error("session key confirmation failed")]
    MacMismatch,

    #[error("server key for {addr} does not match the pinned key")]
    TrustMismatch { addr: String },

    #[error("record failed authentication")]
    RecordAuthentication,

    #[error("record too large: max {max} bytes, got {got}")]
    RecordTooLarge { max: usize, got: usize },

    #[error("known hosts error: {0}")]
    KnownHosts(String),

    #[error("server identity error: {0}")]
    Identity(String),
}

impl ChannelError {
    /// Failures that indicate tampering or impersonation rather than a
    /// broken connection.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            ChannelError::NonContributory
                | ChannelError::BadSignature
                | ChannelError::MacMismatch
                | ChannelError::TrustMismatch { .. }
                | ChannelError::RecordAuthentication
        )
    }

    /// Recover a channel error carried inside an `io::Error` by the record
    /// layer.
    pub fn from_io(err: &io::Error) -> Option<&ChannelError> {
        err.get_ref()?.downcast_ref::<ChannelError>()
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            ChannelError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_classification() {
        assert!(ChannelError::MacMismatch.is_security());
        assert!(ChannelError::TrustMismatch { addr: "h:1".into() }.is_security());
        assert!(!ChannelError::Io(io::ErrorKind::BrokenPipe.into()).is_security());
        assert!(!ChannelError::RecordTooLarge { max: 1, got: 2 }.is_security());
    }

    #[test]
    fn io_wrapping_roundtrip() {
        let err = ChannelError::RecordAuthentication.into_io();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            ChannelError::from_io(&err),
            Some(ChannelError::RecordAuthentication)
        ));

        let plain: io::Error = io::ErrorKind::ConnectionReset.into();
        assert!(ChannelError::from_io(&plain).is_none());
    }
}
