//! Record merge and change-log replay.
//!
//! - [`merge`]: last-writer-wins merge of record batches with tombstones
//! - [`replay`]: idempotent application of change-log entries
//! - [`locks`]: per-account serialization of read-modify-write rounds

pub mod locks;
pub mod merge;
pub mod replay;

pub use locks::AccountLocks;
pub use merge::{apply_remote_records, merge_records, resolve, MergeOutcome, Resolution};
pub use replay::{outgoing_logs, replay_logs, ReplayOutcome};

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("record {record} does not belong to account {account}")]
    ForeignRecord { record: Uuid, account: Uuid },

    #[error("log entry {entry} does not belong to account {account}")]
    ForeignEntry { entry: Uuid, account: Uuid },

    #[error("account lock poisoned")]
    LockPoisoned,
}
