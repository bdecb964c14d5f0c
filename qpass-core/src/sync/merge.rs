//! Last-writer-wins record merge.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::models::Record;
use crate::store::RecordStore;
use crate::sync::SyncError;

/// Outcome of comparing an incoming record against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming is strictly newer.
    AcceptIncoming,
    /// Stored copy is newer or equally new.
    KeepRemote,
}

/// LWW rule: the incoming record wins only with a strictly later
/// `last_changed`. Ties keep the stored copy.
pub fn resolve(remote_last_changed: DateTime<Utc>, incoming: &Record) -> Resolution {
    if incoming.last_changed > remote_last_changed {
        Resolution::AcceptIncoming
    } else {
        Resolution::KeepRemote
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    /// Local rows dropped because the server no longer has them.
    pub removed: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.removed
    }
}

fn check_ownership<S>(store: &S, account: Uuid, incoming: &[Record]) -> Result<(), SyncError>
where
    S: RecordStore + ?Sized,
{
    for record in incoming {
        if record.owner != account {
            return Err(SyncError::ForeignRecord {
                record: record.id,
                account,
            });
        }
    }
    // an id that already exists under someone else is just as foreign
    for record in incoming {
        if store.exists(record.id)? && store.get(record.id)?.owner != account {
            return Err(SyncError::ForeignRecord {
                record: record.id,
                account,
            });
        }
    }
    Ok(())
}

fn apply_batch<S>(store: &S, account: Uuid, incoming: &[Record]) -> Result<MergeOutcome, SyncError>
where
    S: RecordStore + ?Sized,
{
    check_ownership(store, account, incoming)?;

    let mut outcome = MergeOutcome::default();
    for record in incoming {
        if !store.exists(record.id)? {
            store.insert(record)?;
            outcome.inserted += 1;
            continue;
        }

        let existing = store.get(record.id)?;
        if record.deleted {
            if existing.deleted {
                outcome.skipped += 1;
            } else {
                store.delete(record.id, record.last_changed)?;
                outcome.deleted += 1;
            }
            continue;
        }

        match resolve(existing.last_changed, record) {
            Resolution::AcceptIncoming => {
                store.update(record)?;
                outcome.updated += 1;
            }
            Resolution::KeepRemote => outcome.skipped += 1,
        }
    }
    Ok(outcome)
}

/// Server-side merge of a client batch into `account`'s record set.
///
/// Returns the outcome and the full resulting set, tombstones included, so
/// the client can converge on it. The whole batch is refused if any record
/// belongs to another account.
pub fn merge_records<S>(
    store: &S,
    account: Uuid,
    incoming: &[Record],
) -> Result<(MergeOutcome, Vec<Record>), SyncError>
where
    S: RecordStore + ?Sized,
{
    let outcome = apply_batch(store, account, incoming)?;
    debug!(
        %account,
        inserted = outcome.inserted,
        updated = outcome.updated,
        deleted = outcome.deleted,
        skipped = outcome.skipped,
        "Merged record batch"
    );
    let all = store.all_for_account(account, true)?;
    Ok((outcome, all))
}

/// Client-side convergence on the full set returned by the server.
///
/// Rows of `account` missing from `remote` were purged server-side after
/// their tombstone expired, so they are hard-deleted here too. Everything
/// the client sent in the same round is already part of `remote`.
pub fn apply_remote_records<S>(
    store: &S,
    account: Uuid,
    remote: &[Record],
) -> Result<MergeOutcome, SyncError>
where
    S: RecordStore + ?Sized,
{
    let mut outcome = apply_batch(store, account, remote)?;

    let known: HashSet<Uuid> = remote.iter().map(|r| r.id).collect();
    for local in store.all_for_account(account, true)? {
        if !known.contains(&local.id) && store.remove(local.id)? {
            outcome.removed += 1;
        }
    }
    if outcome.removed > 0 {
        debug!(%account, removed = outcome.removed, "Dropped records purged by the server");
    }
    Ok(outcome)
}
