//! Persistence interfaces and the SQLite implementation.
//!
//! The sync engine and the session orchestrator only talk to these traits,
//! so tests and alternative backends can swap the storage out.

mod sqlite;

pub use sqlite::{Database, CURRENT_SCHEMA_VERSION};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Account, LogEntry, Record};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write.
    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait RecordStore {
    fn exists(&self, id: Uuid) -> StoreResult<bool>;

    fn get(&self, id: Uuid) -> StoreResult<Record>;

    fn insert(&self, record: &Record) -> StoreResult<()>;

    /// Overwrite every column of an existing record.
    fn update(&self, record: &Record) -> StoreResult<()>;

    /// Soft delete: set the tombstone flag and stamp `at` as the change time.
    fn delete(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    /// Hard delete. Returns `false` when no such row existed.
    fn remove(&self, id: Uuid) -> StoreResult<bool>;

    fn all_for_account(&self, account: Uuid, include_deleted: bool) -> StoreResult<Vec<Record>>;

    /// Hard-delete tombstones last changed before `before`. Returns the
    /// number of rows removed.
    fn purge_tombstones(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

pub trait LogStore {
    /// Entries for `account` strictly newer than `since`, oldest first.
    fn logs_since(&self, since: DateTime<Utc>, account: Uuid) -> StoreResult<Vec<LogEntry>>;

    /// Append an entry. Returns `false` when an entry with the same id was
    /// already present.
    fn append(&self, entry: &LogEntry) -> StoreResult<bool>;

    fn get_watermark(&self, account: Uuid) -> StoreResult<DateTime<Utc>>;

    fn set_watermark(&self, account: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
}

pub trait AccountStore {
    fn account_exists(&self, id: Uuid) -> StoreResult<bool>;

    fn get_account(&self, id: Uuid) -> StoreResult<Account>;

    /// Look up an account by the server-side hash of its auth token.
    fn find_by_token(&self, token_hash: &[u8]) -> StoreResult<Option<Account>>;

    fn insert_account(&self, account: &Account) -> StoreResult<()>;

    fn set_username(&self, id: Uuid, username: &[u8]) -> StoreResult<()>;

    fn accounts(&self) -> StoreResult<Vec<Account>>;
}

/// Everything a sync participant needs from storage.
pub trait Store: RecordStore + LogStore + AccountStore {}

impl<T: RecordStore + LogStore + AccountStore> Store for T {}
