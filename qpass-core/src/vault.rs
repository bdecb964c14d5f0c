//! Client-side vault: one unlocked account over a local store.
//!
//! Every mutation writes the sealed record and a matching change-log entry,
//! so the next sync round can ship both.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::token::TOKEN_LEN;
use crate::crypto::{
    cipher, client_auth_token, derive_account_key, CryptoError, KdfParams, SecretKey,
};
use crate::models::{now, Account, ChangeKind, LogEntry, PlainRecord, Record};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Incorrect username or password")]
    IncorrectCredentials,

    #[error("An account with this username already exists")]
    AccountExists,

    #[error("Record not found: {0}")]
    RecordNotFound(Uuid),
}

pub type VaultResult<T> = std::result::Result<T, VaultError>;

/// Key material derived from a username and password.
pub struct Credentials {
    key: SecretKey,
    token: [u8; TOKEN_LEN],
}

impl Credentials {
    /// Run Argon2id over the password and derive the auth token from the
    /// result. Slow by construction.
    pub fn derive(username: &str, password: &str, kdf: &KdfParams) -> VaultResult<Self> {
        let key = derive_account_key(username, password, kdf)?;
        let token = client_auth_token(&key, password)?;
        Ok(Self { key, token })
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    /// What gets presented in AUTH and NUSR.
    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

pub struct Vault<S> {
    store: S,
    account: Uuid,
    username: String,
    credentials: Credentials,
}

impl<S: Store> Vault<S> {
    /// Create a brand-new local account and log its AUSR entry.
    pub fn create_account(store: S, username: &str, credentials: Credentials) -> VaultResult<Self> {
        if find_account(&store, username, &credentials)?.is_some() {
            return Err(VaultError::AccountExists);
        }

        let id = Uuid::new_v4();
        let sealed = cipher::seal_str(credentials.key(), username)?;
        store.insert_account(&Account {
            id,
            username: sealed.clone(),
            auth_token: None,
        })?;
        store.append(&LogEntry::new(ChangeKind::AddUser, id).with_names(Vec::new(), sealed))?;

        info!(account = %id, "Created account");
        Ok(Self {
            store,
            account: id,
            username: username.to_string(),
            credentials,
        })
    }

    /// Attach an account that already exists on the server (`id` comes from
    /// its AUTH reply). No AUSR is logged: the server already has one and
    /// will send it back on the first round.
    pub fn adopt_account(
        store: S,
        id: Uuid,
        username: &str,
        credentials: Credentials,
    ) -> VaultResult<Self> {
        if store.account_exists(id)? {
            return Err(VaultError::AccountExists);
        }

        store.insert_account(&Account {
            id,
            username: cipher::seal_str(credentials.key(), username)?,
            auth_token: None,
        })?;

        info!(account = %id, "Adopted account from server");
        Ok(Self {
            store,
            account: id,
            username: username.to_string(),
            credentials,
        })
    }

    /// Unlock the account whose sealed username opens under `credentials`.
    pub fn login(store: S, username: &str, credentials: Credentials) -> VaultResult<Self> {
        let account = find_account(&store, username, &credentials)?
            .ok_or(VaultError::IncorrectCredentials)?;

        debug!(%account, "Unlocked account");
        Ok(Self {
            store,
            account,
            username: username.to_string(),
            credentials,
        })
    }

    pub fn account_id(&self) -> Uuid {
        self.account
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn auth_token(&self) -> &[u8] {
        self.credentials.token()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn add_record(&self, plain: &PlainRecord) -> VaultResult<Uuid> {
        let record = Record::seal(Uuid::new_v4(), self.account, plain, self.credentials.key())?;
        self.store.insert(&record)?;
        self.store.append(
            &LogEntry::new(ChangeKind::AddPassword, self.account)
                .with_names(Vec::new(), record.service.clone())
                .with_secrets(Vec::new(), record.secret.clone()),
        )?;

        debug!(record = %record.id, "Added record");
        Ok(record.id)
    }

    pub fn edit_record(&self, id: Uuid, plain: &PlainRecord) -> VaultResult<()> {
        let old = self.live_record(id)?;
        let mut record = Record::seal(id, self.account, plain, self.credentials.key())?;
        record.last_changed = after(old.last_changed);
        self.store.update(&record)?;
        self.store.append(
            &LogEntry::new(ChangeKind::ModifyPassword, self.account)
                .with_names(old.service, record.service.clone())
                .with_secrets(old.secret, record.secret.clone()),
        )?;

        debug!(record = %id, "Edited record");
        Ok(())
    }

    /// Soft delete. The tombstone syncs like any other change.
    pub fn delete_record(&self, id: Uuid) -> VaultResult<()> {
        let old = self.live_record(id)?;
        self.store.delete(id, after(old.last_changed))?;
        self.store.append(
            &LogEntry::new(ChangeKind::DeletePassword, self.account)
                .with_names(old.service, Vec::new())
                .with_secrets(old.secret, Vec::new()),
        )?;

        debug!(record = %id, "Deleted record");
        Ok(())
    }

    pub fn get_record(&self, id: Uuid) -> VaultResult<PlainRecord> {
        Ok(self.live_record(id)?.open(self.credentials.key())?)
    }

    /// Live records, decrypted, sorted by service name.
    pub fn list_records(&self) -> VaultResult<Vec<(Uuid, PlainRecord)>> {
        let mut records = self
            .store
            .all_for_account(self.account, false)?
            .into_iter()
            .map(|r| Ok((r.id, r.open(self.credentials.key())?)))
            .collect::<VaultResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.1.service.to_lowercase().cmp(&b.1.service.to_lowercase()));
        Ok(records)
    }

    /// Case-insensitive substring match on service and login.
    pub fn search(&self, query: &str) -> VaultResult<Vec<(Uuid, PlainRecord)>> {
        let query = query.to_lowercase();
        Ok(self
            .list_records()?
            .into_iter()
            .filter(|(_, r)| {
                r.service.to_lowercase().contains(&query) || r.login.to_lowercase().contains(&query)
            })
            .collect())
    }

    fn live_record(&self, id: Uuid) -> VaultResult<Record> {
        let record = match self.store.get(id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Err(VaultError::RecordNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if record.owner != self.account || record.deleted {
            return Err(VaultError::RecordNotFound(id));
        }
        Ok(record)
    }
}

/// A change must land strictly after the version it replaces, or LWW would
/// throw it away on the peer.
fn after(previous: DateTime<Utc>) -> DateTime<Utc> {
    now().max(previous + Duration::microseconds(1))
}

/// The local account `credentials` unlock for `username`, if any.
pub fn find_account<S: Store>(
    store: &S,
    username: &str,
    credentials: &Credentials,
) -> VaultResult<Option<Uuid>> {
    for account in store.accounts()? {
        // a failed open just means a different account or password
        if let Ok(name) = cipher::open_str(credentials.key(), &account.username) {
            if name == username {
                return Ok(Some(account.id));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::test_params;
    use crate::models::epoch;
    use crate::store::{AccountStore, Database, LogStore, RecordStore};

    fn credentials(username: &str, password: &str) -> Credentials {
        Credentials::derive(username, password, &test_params()).unwrap()
    }

    fn new_vault() -> Vault<Database> {
        Vault::create_account(Database::in_memory().unwrap(), "alice", credentials("alice", "pw"))
            .unwrap()
    }

    #[test]
    fn create_account_logs_sealed_username() {
        let vault = new_vault();
        let logs = vault.store().logs_since(epoch(), vault.account_id()).unwrap();

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, ChangeKind::AddUser);
        assert_ne!(logs[0].new_name, b"alice");
        let account = vault.store().get_account(vault.account_id()).unwrap();
        assert_eq!(account.username, logs[0].new_name);
        assert!(account.auth_token.is_none());
    }

    #[test]
    fn login_finds_account_by_credentials() {
        let vault = new_vault();
        let store = vault.store().clone();
        let id = vault.account_id();

        let again = Vault::login(store.clone(), "alice", credentials("alice", "pw")).unwrap();
        assert_eq!(again.account_id(), id);
        assert_eq!(again.auth_token(), vault.auth_token());

        assert!(matches!(
            Vault::login(store.clone(), "alice", credentials("alice", "wrong")),
            Err(VaultError::IncorrectCredentials)
        ));
        assert!(matches!(
            Vault::login(store, "bob", credentials("bob", "pw")),
            Err(VaultError::IncorrectCredentials)
        ));
    }

    #[test]
    fn duplicate_account_is_rejected() {
        let vault = new_vault();
        let result =
            Vault::create_account(vault.store().clone(), "alice", credentials("alice", "pw"));
        assert!(matches!(result, Err(VaultError::AccountExists)));
    }

    #[test]
    fn two_accounts_share_a_store() {
        let alice = new_vault();
        let bob = Vault::create_account(alice.store().clone(), "bob", credentials("bob", "pw"))
            .unwrap();
        alice.add_record(&PlainRecord::new("a.com", "alice", "1")).unwrap();
        bob.add_record(&PlainRecord::new("b.com", "bob", "2")).unwrap();

        assert_eq!(alice.list_records().unwrap().len(), 1);
        assert_eq!(bob.list_records().unwrap()[0].1.service, "b.com");
    }

    #[test]
    fn adopt_account_writes_no_log() {
        let store = Database::in_memory().unwrap();
        let id = Uuid::new_v4();
        let vault = Vault::adopt_account(store, id, "alice", credentials("alice", "pw")).unwrap();

        assert_eq!(vault.account_id(), id);
        assert!(vault.store().logs_since(epoch(), id).unwrap().is_empty());
        let again = Vault::login(vault.store().clone(), "alice", credentials("alice", "pw"));
        assert_eq!(again.unwrap().account_id(), id);
    }

    #[test]
    fn add_edit_delete_lifecycle() {
        let vault = new_vault();
        let id = vault.add_record(&PlainRecord::new("example.com", "me", "one")).unwrap();
        let added = vault.store().get(id).unwrap();

        vault
            .edit_record(id, &PlainRecord::new("example.com", "me", "two"))
            .unwrap();
        let edited = vault.store().get(id).unwrap();
        assert!(edited.last_changed > added.last_changed);
        assert_eq!(vault.get_record(id).unwrap().secret, "two");

        vault.delete_record(id).unwrap();
        let deleted = vault.store().get(id).unwrap();
        assert!(deleted.deleted);
        assert!(deleted.last_changed > edited.last_changed);
        assert!(vault.list_records().unwrap().is_empty());
        assert!(matches!(vault.get_record(id), Err(VaultError::RecordNotFound(_))));
        assert!(matches!(vault.delete_record(id), Err(VaultError::RecordNotFound(_))));

        let kinds: Vec<_> = vault
            .store()
            .logs_since(epoch(), vault.account_id())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::AddUser,
                ChangeKind::AddPassword,
                ChangeKind::ModifyPassword,
                ChangeKind::DeletePassword,
            ]
        );
    }

    #[test]
    fn edit_of_unknown_record_fails() {
        let vault = new_vault();
        let result = vault.edit_record(Uuid::new_v4(), &PlainRecord::new("s", "l", "p"));
        assert!(matches!(result, Err(VaultError::RecordNotFound(_))));
    }

    #[test]
    fn search_matches_service_and_login() {
        let vault = new_vault();
        vault.add_record(&PlainRecord::new("GitHub", "octo", "1")).unwrap();
        vault.add_record(&PlainRecord::new("mail", "alice@git.example", "2")).unwrap();
        vault.add_record(&PlainRecord::new("bank", "acct", "3")).unwrap();

        let hits = vault.search("git").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.service, "GitHub");
    }
}
