//! qpass core library
//!
//! Everything shared by the qpass client and server: sealed records and the
//! change log, the SQLite store, the secure channel, the wire protocol, the
//! sync engine and the session orchestration on top of them.

pub mod channel;
pub mod crypto;
pub mod models;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod store;
pub mod sync;
pub mod vault;

pub use channel::{ChannelError, FileKnownHosts, KnownHosts, MemoryKnownHosts, ServerIdentity};
pub use crypto::{CryptoError, KdfParams, SecretKey};
pub use models::{Account, ChangeKind, LogEntry, PlainRecord, Record};
pub use platform::{
    ensure_config_dir, ensure_data_dir, get_client_config_path, get_config_dir, get_data_dir,
    get_default_key_dir, get_default_server_db_path, get_default_vault_path,
    get_known_hosts_path, get_server_config_path,
};
pub use protocol::{CodecError, FrameError, Payload, PayloadType};
pub use session::{
    register_account, run_sync_round, serve, RoundSummary, ServerSession, SessionError,
    SyncClient,
};
pub use store::{Database, Store, StoreError};
pub use sync::{AccountLocks, SyncError};
pub use vault::{find_account, Credentials, Vault, VaultError};

use thiserror::Error;

/// Result type for qpass operations
pub type Result<T> = std::result::Result<T, QpassError>;

/// Any error a qpass operation can surface
#[derive(Error, Debug)]
pub enum QpassError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QpassError {
    /// Tampering or impersonation, as opposed to a broken connection or a
    /// refused request.
    pub fn is_security(&self) -> bool {
        match self {
            QpassError::Channel(e) => e.is_security(),
            QpassError::Session(e) => e.is_security(),
            QpassError::Io(e) => ChannelError::from_io(e).map_or(false, ChannelError::is_security),
            _ => false,
        }
    }
}
