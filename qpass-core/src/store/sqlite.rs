//! SQLite store.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::models::{epoch, Account, ChangeKind, LogEntry, Record};
use crate::store::{AccountStore, LogStore, RecordStore, StoreError, StoreResult};

/// Current schema version, stored in `PRAGMA user_version`.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Thread-safe handle to one SQLite database. Clones share the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn initialize_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "schema version {} is newer than supported version {}",
                version, CURRENT_SCHEMA_VERSION
            )));
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                username BLOB NOT NULL,
                auth_token BLOB UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                service BLOB NOT NULL,
                login BLOB NOT NULL,
                secret BLOB NOT NULL,
                last_changed INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS change_log (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                owner TEXT NOT NULL,
                old_name BLOB NOT NULL,
                new_name BLOB NOT NULL,
                old_secret BLOB NOT NULL,
                new_secret BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_cursor (
                account TEXT PRIMARY KEY,
                last_sync INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_owner ON records(owner, deleted);
            CREATE INDEX IF NOT EXISTS idx_change_log_owner ON change_log(owner, timestamp);",
        )?;
        conn.execute_batch(&format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION))?;
        Ok(())
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(value: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", value)))
}

fn parse_uuid(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("bad uuid {:?}: {}", value, e)))
}

// Raw column values; converted outside the rusqlite closure so conversion
// errors surface as StoreError::Corrupt.
type RecordRow = (String, String, Vec<u8>, Vec<u8>, Vec<u8>, i64, bool);

const RECORD_COLUMNS: &str = "id, owner, service, login, secret, last_changed, deleted";

fn record_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn record_from_row(row: RecordRow) -> StoreResult<Record> {
    let (id, owner, service, login, secret, last_changed, deleted) = row;
    Ok(Record {
        id: parse_uuid(&id)?,
        owner: parse_uuid(&owner)?,
        service,
        login,
        secret,
        last_changed: from_micros(last_changed)?,
        deleted,
    })
}

type LogRow = (String, String, i64, String, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>);

fn log_from_row(row: LogRow) -> StoreResult<LogEntry> {
    let (id, kind, timestamp, owner, old_name, new_name, old_secret, new_secret) = row;
    Ok(LogEntry {
        id: parse_uuid(&id)?,
        kind: kind.parse::<ChangeKind>().map_err(StoreError::Corrupt)?,
        timestamp: from_micros(timestamp)?,
        owner: parse_uuid(&owner)?,
        old_name,
        new_name,
        old_secret,
        new_secret,
    })
}

type AccountRow = (String, Vec<u8>, Option<Vec<u8>>);

fn account_from_row(row: AccountRow) -> StoreResult<Account> {
    let (id, username, auth_token) = row;
    Ok(Account {
        id: parse_uuid(&id)?,
        username,
        auth_token,
    })
}

impl RecordStore for Database {
    fn exists(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM records WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get(&self, id: Uuid) -> StoreResult<Record> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE id = ?1", RECORD_COLUMNS),
                [id.to_string()],
                record_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("record {}", id)))?;
        record_from_row(row)
    }

    fn insert(&self, record: &Record) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                RECORD_COLUMNS
            ),
            params![
                record.id.to_string(),
                record.owner.to_string(),
                record.service,
                record.login,
                record.secret,
                micros(record.last_changed),
                record.deleted,
            ],
        )?;
        Ok(())
    }

    fn update(&self, record: &Record) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE records
             SET owner = ?2, service = ?3, login = ?4, secret = ?5, last_changed = ?6, deleted = ?7
             WHERE id = ?1",
            params![
                record.id.to_string(),
                record.owner.to_string(),
                record.service,
                record.login,
                record.secret,
                micros(record.last_changed),
                record.deleted,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("record {}", record.id)));
        }
        Ok(())
    }

    fn delete(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE records SET deleted = 1, last_changed = ?2 WHERE id = ?1",
            params![id.to_string(), micros(at)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("record {}", id)));
        }
        Ok(())
    }

    fn remove(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM records WHERE id = ?1", [id.to_string()])?;
        Ok(removed > 0)
    }

    fn all_for_account(&self, account: Uuid, include_deleted: bool) -> StoreResult<Vec<Record>> {
        let conn = self.conn()?;
        let sql = if include_deleted {
            format!(
                "SELECT {} FROM records WHERE owner = ?1 ORDER BY last_changed, id",
                RECORD_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM records WHERE owner = ?1 AND deleted = 0 ORDER BY last_changed, id",
                RECORD_COLUMNS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([account.to_string()], record_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(record_from_row).collect()
    }

    fn purge_tombstones(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE deleted = 1 AND last_changed < ?1",
            [micros(before)],
        )?;
        if removed > 0 {
            debug!(removed, "Purged tombstones");
        }
        Ok(removed)
    }
}

impl LogStore for Database {
    fn logs_since(&self, since: DateTime<Utc>, account: Uuid) -> StoreResult<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, kind, timestamp, owner, old_name, new_name, old_secret, new_secret
             FROM change_log
             WHERE owner = ?1 AND timestamp > ?2
             ORDER BY timestamp, id",
        )?;
        let rows = stmt
            .query_map(params![account.to_string(), micros(since)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<LogRow>>>()?;
        rows.into_iter().map(log_from_row).collect()
    }

    fn append(&self, entry: &LogEntry) -> StoreResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO change_log
                (id, kind, timestamp, owner, old_name, new_name, old_secret, new_secret)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id.to_string(),
                entry.kind.code(),
                micros(entry.timestamp),
                entry.owner.to_string(),
                entry.old_name,
                entry.new_name,
                entry.old_secret,
                entry.new_secret,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_watermark(&self, account: Uuid) -> StoreResult<DateTime<Utc>> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT last_sync FROM sync_cursor WHERE account = ?1",
                [account.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => from_micros(value),
            None => Ok(epoch()),
        }
    }

    fn set_watermark(&self, account: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_cursor (account, last_sync) VALUES (?1, ?2)
             ON CONFLICT(account) DO UPDATE SET last_sync = excluded.last_sync",
            params![account.to_string(), micros(at)],
        )?;
        Ok(())
    }
}

impl AccountStore for Database {
    fn account_exists(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM accounts WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_account(&self, id: Uuid) -> StoreResult<Account> {
        let conn = self.conn()?;
        let row: AccountRow = conn
            .query_row(
                "SELECT id, username, auth_token FROM accounts WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        account_from_row(row)
    }

    fn find_by_token(&self, token_hash: &[u8]) -> StoreResult<Option<Account>> {
        let conn = self.conn()?;
        let row: Option<AccountRow> = conn
            .query_row(
                "SELECT id, username, auth_token FROM accounts WHERE auth_token = ?1",
                [token_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(account_from_row).transpose()
    }

    fn insert_account(&self, account: &Account) -> StoreResult<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO accounts (id, username, auth_token, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                account.id.to_string(),
                account.username,
                account.auth_token,
                Utc::now().timestamp(),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::Duplicate(format!("account {}", account.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_username(&self, id: Uuid, username: &[u8]) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE accounts SET username = ?2 WHERE id = ?1",
            params![id.to_string(), username],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("account {}", id)));
        }
        Ok(())
    }

    fn accounts(&self) -> StoreResult<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, username, auth_token FROM accounts ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<AccountRow>>>()?;
        rows.into_iter().map(account_from_row).collect()
    }
}
