//! Records, accounts and change-log entries.
//!
//! Everything sensitive is held sealed (see [`crate::crypto::seal`]); the
//! server only ever sees these opaque blobs.

use crate::crypto::{cipher, CryptoError, SecretKey};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current time truncated to the microsecond resolution used on the wire
/// and in storage.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The "never synced" watermark.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One password entry as stored and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub owner: Uuid,
    pub service: Vec<u8>,
    pub login: Vec<u8>,
    pub secret: Vec<u8>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub last_changed: DateTime<Utc>,
    pub deleted: bool,
}

/// Decrypted view of a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainRecord {
    pub service: String,
    pub login: String,
    pub secret: String,
}

impl PlainRecord {
    pub fn new(
        service: impl Into<String>,
        login: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            login: login.into(),
            secret: secret.into(),
        }
    }
}

impl Record {
    /// Encrypt `plain` under `key`, stamped with the current time.
    pub fn seal(
        id: Uuid,
        owner: Uuid,
        plain: &PlainRecord,
        key: &SecretKey,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            id,
            owner,
            service: cipher::seal_str(key, &plain.service)?,
            login: cipher::seal_str(key, &plain.login)?,
            secret: cipher::seal_str(key, &plain.secret)?,
            last_changed: now(),
            deleted: false,
        })
    }

    pub fn open(&self, key: &SecretKey) -> Result<PlainRecord, CryptoError> {
        Ok(PlainRecord {
            service: cipher::open_str(key, &self.service)?,
            login: cipher::open_str(key, &self.login)?,
            secret: cipher::open_str(key, &self.secret)?,
        })
    }

    /// Mark as deleted and refresh the change time. Fields are kept.
    pub fn tombstone(&mut self, at: DateTime<Utc>) {
        self.deleted = true;
        self.last_changed = at;
    }
}

/// An account as known to a store.
///
/// `username` is sealed under the account key; the server holds an empty
/// username until the account's AUSR entry is replayed to it.
/// `auth_token` is only set server-side and holds the hash of the client
/// token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub username: Vec<u8>,
    pub auth_token: Option<Vec<u8>>,
}

/// Kind of change recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    AddUser,
    ModifyUser,
    DeleteUser,
    AddPassword,
    ModifyPassword,
    DeletePassword,
}

impl ChangeKind {
    pub fn code(&self) -> &'static str {
        match self {
            ChangeKind::AddUser => "AUSR",
            ChangeKind::ModifyUser => "MUSR",
            ChangeKind::DeleteUser => "DUSR",
            ChangeKind::AddPassword => "APWD",
            ChangeKind::ModifyPassword => "MPWD",
            ChangeKind::DeletePassword => "DPWD",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUSR" => Ok(ChangeKind::AddUser),
            "MUSR" => Ok(ChangeKind::ModifyUser),
            "DUSR" => Ok(ChangeKind::DeleteUser),
            "APWD" => Ok(ChangeKind::AddPassword),
            "MPWD" => Ok(ChangeKind::ModifyPassword),
            "DPWD" => Ok(ChangeKind::DeletePassword),
            other => Err(format!("unknown change kind: {}", other)),
        }
    }
}

/// One immutable change-log entry. All value fields are opaque sealed bytes
/// and are empty when a kind does not use them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub kind: ChangeKind,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub timestamp: DateTime<Utc>,
    pub owner: Uuid,
    pub old_name: Vec<u8>,
    pub new_name: Vec<u8>,
    pub old_secret: Vec<u8>,
    pub new_secret: Vec<u8>,
}

impl LogEntry {
    /// Start an entry of `kind` for `owner`, stamped now with a fresh id.
    pub fn new(kind: ChangeKind, owner: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: now(),
            owner,
            old_name: Vec::new(),
            new_name: Vec::new(),
            old_secret: Vec::new(),
            new_secret: Vec::new(),
        }
    }

    pub fn with_names(mut self, old_name: Vec<u8>, new_name: Vec<u8>) -> Self {
        self.old_name = old_name;
        self.new_name = new_name;
        self
    }

    pub fn with_secrets(mut self, old_secret: Vec<u8>, new_secret: Vec<u8>) -> Self {
        self.old_secret = old_secret;
        self.new_secret = new_secret;
        self
    }
}
