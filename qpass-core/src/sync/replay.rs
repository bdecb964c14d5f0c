//! Change-log replay.
//!
//! Both sides send every entry newer than the peer's watermark. Entries are
//! appended idempotently by id; AUSR entries additionally materialise the
//! account (or its sealed username) when the receiver lacks it.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Account, ChangeKind, LogEntry};
use crate::store::{AccountStore, LogStore};
use crate::sync::SyncError;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub appended: usize,
    pub duplicates: usize,
    pub accounts_created: usize,
    pub usernames_set: usize,
}

/// Entries `account` has produced since `since`.
pub fn outgoing_logs<S>(store: &S, account: Uuid, since: DateTime<Utc>) -> Result<Vec<LogEntry>, SyncError>
where
    S: LogStore + ?Sized,
{
    Ok(store.logs_since(since, account)?)
}

/// Apply entries received for `account`.
pub fn replay_logs<S>(store: &S, account: Uuid, entries: &[LogEntry]) -> Result<ReplayOutcome, SyncError>
where
    S: LogStore + AccountStore + ?Sized,
{
    if let Some(foreign) = entries.iter().find(|e| e.owner != account) {
        return Err(SyncError::ForeignEntry {
            entry: foreign.id,
            account,
        });
    }

    let mut outcome = ReplayOutcome::default();
    for entry in entries {
        if entry.kind == ChangeKind::AddUser {
            apply_add_user(store, entry, &mut outcome)?;
        }
        if store.append(entry)? {
            outcome.appended += 1;
        } else {
            outcome.duplicates += 1;
        }
    }

    debug!(
        %account,
        appended = outcome.appended,
        duplicates = outcome.duplicates,
        "Replayed log entries"
    );
    Ok(outcome)
}

fn apply_add_user<S>(store: &S, entry: &LogEntry, outcome: &mut ReplayOutcome) -> Result<(), SyncError>
where
    S: AccountStore + ?Sized,
{
    if !store.account_exists(entry.owner)? {
        store.insert_account(&Account {
            id: entry.owner,
            username: entry.new_name.clone(),
            auth_token: None,
        })?;
        info!(account = %entry.owner, "Created account from replayed log");
        outcome.accounts_created += 1;
        return Ok(());
    }

    let existing = store.get_account(entry.owner)?;
    if existing.username.is_empty() && !entry.new_name.is_empty() {
        store.set_username(entry.owner, &entry.new_name)?;
        outcome.usernames_set += 1;
    }
    Ok(())
}
