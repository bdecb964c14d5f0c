use std::time::Duration;

use tokio::io::{duplex, DuplexStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::server::{
    FAIL_ALREADY_AUTHENTICATED, FAIL_AUTHENTICATION, FAIL_NOT_AUTHENTICATED, FAIL_TOO_LARGE,
    FAIL_UNEXPECTED, FAIL_UNKNOWN_ACCOUNT, FAIL_USER_EXISTS,
};
use super::*;
use crate::channel::identity::test_support::test_key;
use crate::channel::{server_handshake, MemoryKnownHosts};
use crate::crypto::kdf::test_params;
use crate::crypto::server_token_hash;
use crate::models::{epoch, Account, PlainRecord, Record};
use crate::protocol::{
    read_payload, write_payload, AuthData, NewUserData, Payload, PayloadType, SyncData,
};
use crate::store::{AccountStore, Database, LogStore, RecordStore};
use crate::sync::{outgoing_logs, AccountLocks};
use crate::vault::{Credentials, Vault};

const TIMEOUT: Duration = Duration::from_secs(10);
const ADDR: &str = "test:1717";

fn credentials(username: &str, password: &str) -> Credentials {
    Credentials::derive(username, password, &test_params()).unwrap()
}

/// Server account registered directly in `store` under `creds`' token.
fn seed_account(store: &Database, creds: &Credentials) -> Uuid {
    let id = Uuid::new_v4();
    store
        .insert_account(&Account {
            id,
            username: Vec::new(),
            auth_token: Some(server_token_hash(creds.token()).to_vec()),
        })
        .unwrap();
    id
}

fn spawn_server(store: Database) -> (DuplexStream, JoinHandle<Result<(), SessionError>>) {
    let (client_io, server_io) = duplex(1 << 16);
    let handle = tokio::spawn(async move {
        let mut channel = server_handshake(server_io, test_key(), &test_params()).await?;
        let mut session = ServerSession::new(store, AccountLocks::new());
        serve(&mut channel, &mut session, TIMEOUT).await
    });
    (client_io, handle)
}

/// A server that drops the connection right after answering `last`.
fn spawn_dying_server(store: Database, last: PayloadType) -> (DuplexStream, JoinHandle<()>) {
    let (client_io, server_io) = duplex(1 << 16);
    let handle = tokio::spawn(async move {
        let mut channel = server_handshake(server_io, test_key(), &test_params())
            .await
            .unwrap();
        let mut session = ServerSession::new(store, AccountLocks::new());
        loop {
            let payload = read_payload(&mut channel).await.unwrap();
            let outcome = session.handle(&payload);
            if let Some(reply) = &outcome.reply {
                write_payload(reply, &mut channel).await.unwrap();
            }
            if payload.kind() == last {
                return;
            }
        }
    });
    (client_io, handle)
}

async fn connect(io: DuplexStream, hosts: &MemoryKnownHosts) -> SyncClient<DuplexStream> {
    SyncClient::connect_stream(io, ADDR, hosts, &test_params(), TIMEOUT)
        .await
        .unwrap()
}

fn rejection(err: SessionError) -> String {
    match err {
        SessionError::Rejected(msg) => msg,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| r.id);
    records
}

#[tokio::test]
async fn auth_then_empty_sync_returns_server_records() {
    let server_store = Database::in_memory().unwrap();
    let creds = credentials("u", "p");
    let account = seed_account(&server_store, &creds);
    let stored = Record::seal(
        Uuid::new_v4(),
        account,
        &PlainRecord::new("svc", "me", "pw"),
        creds.key(),
    )
    .unwrap();
    server_store.insert(&stored).unwrap();

    let (io, server) = spawn_server(server_store);
    let hosts = MemoryKnownHosts::new();
    let mut client = connect(io, &hosts).await;

    client.ping().await.unwrap();
    assert_eq!(client.authenticate(creds.token()).await.unwrap(), account);
    let records = client.sync_records(account, Vec::new(), epoch()).await.unwrap();
    assert_eq!(records, vec![stored]);

    client.finish().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn sync_before_auth_is_refused_and_session_survives() {
    let (io, server) = spawn_server(Database::in_memory().unwrap());
    let hosts = MemoryKnownHosts::new();
    let mut client = connect(io, &hosts).await;

    let err = client
        .sync_records(Uuid::new_v4(), Vec::new(), epoch())
        .await
        .unwrap_err();
    assert_eq!(rejection(err), FAIL_NOT_AUTHENTICATED);

    let err = client
        .sync_logs(Uuid::new_v4(), Vec::new(), epoch())
        .await
        .unwrap_err();
    assert_eq!(rejection(err), FAIL_NOT_AUTHENTICATED);

    client.ping().await.unwrap();
    client.finish().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn bad_token_then_good_token() {
    let server_store = Database::in_memory().unwrap();
    let creds = credentials("u", "p");
    let account = seed_account(&server_store, &creds);

    let (io, server) = spawn_server(server_store);
    let hosts = MemoryKnownHosts::new();
    let mut client = connect(io, &hosts).await;

    let wrong = credentials("u", "not-p");
    let err = client.authenticate(wrong.token()).await.unwrap_err();
    assert_eq!(rejection(err), FAIL_AUTHENTICATION);

    assert_eq!(client.authenticate(creds.token()).await.unwrap(), account);
    let err = client.authenticate(creds.token()).await.unwrap_err();
    assert_eq!(rejection(err), FAIL_ALREADY_AUTHENTICATED);

    client.finish().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn sync_for_another_account_is_refused() {
    let server_store = Database::in_memory().unwrap();
    let creds = credentials("u", "p");
    seed_account(&server_store, &creds);

    let (io, server) = spawn_server(server_store);
    let hosts = MemoryKnownHosts::new();
    let mut client = connect(io, &hosts).await;

    client.authenticate(creds.token()).await.unwrap();
    let err = client
        .sync_records(Uuid::new_v4(), Vec::new(), epoch())
        .await
        .unwrap_err();
    assert_eq!(rejection(err), FAIL_UNKNOWN_ACCOUNT);

    client.finish().await.unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn register_twice_fails() {
    let server_store = Database::in_memory().unwrap();
    let creds = credentials("u", "p");
    let account = Uuid::new_v4();
    let hosts = MemoryKnownHosts::new();

    let (io, server) = spawn_server(server_store.clone());
    let client = connect(io, &hosts).await;
    let id = register_account(client, account, creds.token()).await.unwrap();
    assert_eq!(id, account);
    server.await.unwrap().unwrap();

    let stored = server_store.get_account(account).unwrap();
    assert_eq!(
        stored.auth_token.unwrap(),
        server_token_hash(creds.token()).to_vec()
    );

    let (io, server) = spawn_server(server_store);
    let client = connect(io, &hosts).await;
    let err = register_account(client, Uuid::new_v4(), creds.token())
        .await
        .unwrap_err();
    assert_eq!(rejection(err), FAIL_USER_EXISTS);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn two_devices_converge_through_the_server() {
    let server_store = Database::in_memory().unwrap();
    let hosts = MemoryKnownHosts::new();

    // device A creates the account and registers it
    let a = Vault::create_account(Database::in_memory().unwrap(), "u", credentials("u", "p"))
        .unwrap();
    let account = a.account_id();
    let (io, server) = spawn_server(server_store.clone());
    register_account(connect(io, &hosts).await, account, a.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    let first = a.add_record(&PlainRecord::new("one.example", "me", "1")).unwrap();
    a.add_record(&PlainRecord::new("two.example", "me", "2")).unwrap();

    let (io, server) = spawn_server(server_store.clone());
    let summary = run_sync_round(connect(io, &hosts).await, a.store(), account, a.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(summary.logs_sent, 3);
    assert_eq!(summary.records_sent, 2);

    // the replayed AUSR filled in the server's blank username
    let on_server = server_store.get_account(account).unwrap();
    assert_eq!(on_server.username, a.store().get_account(account).unwrap().username);
    assert_eq!(server_store.logs_since(epoch(), account).unwrap().len(), 3);

    // device B joins with the same credentials
    let (io, server) = spawn_server(server_store.clone());
    let mut client = connect(io, &hosts).await;
    let joined = client.authenticate(credentials("u", "p").token()).await.unwrap();
    client.finish().await.unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(joined, account);

    let b = Vault::adopt_account(
        Database::in_memory().unwrap(),
        joined,
        "u",
        credentials("u", "p"),
    )
    .unwrap();
    let (io, server) = spawn_server(server_store.clone());
    let summary = run_sync_round(connect(io, &hosts).await, b.store(), account, b.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(summary.logs_sent, 0);
    assert_eq!(summary.logs.appended, 3);
    assert_eq!(summary.records.inserted, 2);
    assert_eq!(b.list_records().unwrap(), a.list_records().unwrap());

    // B deletes, A picks up the tombstone
    b.delete_record(first).unwrap();
    let (io, server) = spawn_server(server_store.clone());
    let summary = run_sync_round(connect(io, &hosts).await, b.store(), account, b.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(summary.logs_sent, 1);
    assert_eq!(summary.records_sent, 1);

    let (io, server) = spawn_server(server_store.clone());
    let summary = run_sync_round(connect(io, &hosts).await, a.store(), account, a.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    assert_eq!(summary.records.deleted, 1);

    assert_eq!(a.list_records().unwrap().len(), 1);
    assert_eq!(
        sorted(a.store().all_for_account(account, true).unwrap()),
        sorted(b.store().all_for_account(account, true).unwrap())
    );
    assert_eq!(
        sorted(server_store.all_for_account(account, true).unwrap()),
        sorted(a.store().all_for_account(account, true).unwrap())
    );
}

#[tokio::test]
async fn failed_round_keeps_watermark_and_retries_same_window() {
    let server_store = Database::in_memory().unwrap();
    let hosts = MemoryKnownHosts::new();
    let vault = Vault::create_account(Database::in_memory().unwrap(), "u", credentials("u", "p"))
        .unwrap();
    let account = vault.account_id();

    let (io, server) = spawn_server(server_store.clone());
    register_account(connect(io, &hosts).await, account, vault.auth_token())
        .await
        .unwrap();
    server.await.unwrap().unwrap();
    vault.add_record(&PlainRecord::new("svc", "me", "pw")).unwrap();
    let pending = outgoing_logs(vault.store(), account, epoch()).unwrap();

    // connection drops after SUSR, before SYNC and SUCC
    let (io, server) = spawn_dying_server(server_store.clone(), PayloadType::Susr);
    let result =
        run_sync_round(connect(io, &hosts).await, vault.store(), account, vault.auth_token()).await;
    server.await.unwrap();
    assert!(result.is_err());
    assert_eq!(vault.store().get_watermark(account).unwrap(), epoch());
    assert_eq!(outgoing_logs(vault.store(), account, epoch()).unwrap(), pending);
    assert_eq!(server_store.get_watermark(account).unwrap(), epoch());

    let (io, server) = spawn_server(server_store.clone());
    let summary =
        run_sync_round(connect(io, &hosts).await, vault.store(), account, vault.auth_token())
            .await
            .unwrap();
    server.await.unwrap().unwrap();

    assert_eq!(summary.logs_sent, pending.len());
    assert_eq!(summary.records_sent, 1);
    // the server already had these from the failed round
    assert_eq!(server_store.logs_since(epoch(), account).unwrap(), pending);
    assert_eq!(vault.store().logs_since(epoch(), account).unwrap(), pending);
    assert!(vault.store().get_watermark(account).unwrap() > epoch());
    assert!(server_store.get_watermark(account).unwrap() > epoch());
}

#[tokio::test]
async fn pinned_key_mismatch_aborts_before_any_payload() {
    use crate::channel::identity::test_support::other_test_key;
    use crate::channel::KnownHosts;

    let hosts = MemoryKnownHosts::new();
    hosts.pin(ADDR, other_test_key().public_key()).unwrap();

    let (io, server) = spawn_server(Database::in_memory().unwrap());
    let result = SyncClient::connect_stream(io, ADDR, &hosts, &test_params(), TIMEOUT).await;
    let err = match result {
        Ok(_) => panic!("handshake should fail"),
        Err(err) => err,
    };
    assert!(err.is_security());
    // the server side sees the client hang up
    let _ = server.await.unwrap();
}

mod state_machine {
    use super::*;

    fn session() -> (ServerSession<Database>, Database) {
        let store = Database::in_memory().unwrap();
        (ServerSession::new(store.clone(), AccountLocks::new()), store)
    }

    fn auth_payload(token: &[u8]) -> Payload {
        let body = AuthData {
            token: token.to_vec(),
        }
        .encode()
        .unwrap();
        Payload::new(PayloadType::Auth, body).unwrap()
    }

    #[test]
    fn ping_works_unauthenticated() {
        let (mut session, _) = session();
        let outcome = session.handle(&Payload::ping());
        assert_eq!(outcome.reply, Some(Payload::pong()));
        assert!(!outcome.close);
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn unexpected_kind_gets_fail() {
        let (mut session, _) = session();
        let reply = session.handle(&Payload::pong()).reply.unwrap();
        assert_eq!(reply.kind(), PayloadType::Fail);
        assert_eq!(reply.message(), FAIL_UNEXPECTED);
    }

    #[test]
    fn malformed_body_is_reported() {
        let (mut session, _) = session();
        let payload = Payload::new(PayloadType::Auth, vec![9, 9]).unwrap();
        let reply = session.handle(&payload).reply.unwrap();
        assert_eq!(reply.kind(), PayloadType::Fail);
        assert!(reply.message().starts_with("malformed payload"));
    }

    #[test]
    fn succ_closes_and_silences_the_session() {
        let (mut session, _) = session();
        let outcome = session.handle(&Payload::succ());
        assert!(outcome.close);
        assert!(outcome.reply.is_none());
        assert_eq!(session.state(), SessionState::Closed);

        let outcome = session.handle(&Payload::ping());
        assert!(outcome.close);
        assert!(outcome.reply.is_none());
    }

    #[test]
    fn invalid_uuid_is_replaced_on_registration() {
        let (mut session, store) = session();
        let body = NewUserData {
            uuid: "not-a-uuid".to_string(),
            token: vec![7; 32],
        }
        .encode()
        .unwrap();

        let reply = session
            .handle(&Payload::new(PayloadType::Nusr, body).unwrap())
            .reply
            .unwrap();
        assert_eq!(reply.kind(), PayloadType::Succ);
        let id = Uuid::from_slice(reply.body()).unwrap();
        assert!(store.account_exists(id).unwrap());
    }

    #[test]
    fn watermark_commits_only_on_succ() {
        let (mut session, store) = session();
        let creds = credentials("u", "p");
        let account = seed_account(&store, &creds);

        let reply = session.handle(&auth_payload(creds.token())).reply.unwrap();
        assert_eq!(reply.kind(), PayloadType::Succ);
        assert_eq!(reply.body(), account.as_bytes());
        assert_eq!(session.state(), SessionState::Authenticated(account));

        let body = SyncData::with_logs(account, epoch(), Vec::new()).encode().unwrap();
        let reply = session
            .handle(&Payload::new(PayloadType::Susr, body).unwrap())
            .reply
            .unwrap();
        assert_eq!(reply.kind(), PayloadType::Susr);
        assert_eq!(store.get_watermark(account).unwrap(), epoch());

        session.handle(&Payload::succ());
        assert!(store.get_watermark(account).unwrap() > epoch());
    }

    #[test]
    fn oversize_record_set_is_refused_explicitly() {
        let (mut session, store) = session();
        let creds = credentials("u", "p");
        let account = seed_account(&store, &creds);
        for _ in 0..30 {
            store
                .insert(&Record {
                    id: Uuid::new_v4(),
                    owner: account,
                    service: vec![1; 64],
                    login: vec![2; 64],
                    secret: vec![3; 2048],
                    last_changed: crate::models::now(),
                    deleted: false,
                })
                .unwrap();
        }
        session.handle(&auth_payload(creds.token()));

        let body = SyncData::with_records(account, epoch(), Vec::new()).encode().unwrap();
        let outcome = session.handle(&Payload::new(PayloadType::Sync, body).unwrap());
        let reply = outcome.reply.unwrap();
        assert_eq!(reply.kind(), PayloadType::Fail);
        assert_eq!(reply.message(), FAIL_TOO_LARGE);
        assert!(!outcome.close);

        assert_eq!(session.handle(&Payload::ping()).reply, Some(Payload::pong()));
    }

    /// Sees no existing accounts, as if a concurrent registration had not
    /// committed yet when the lookups ran.
    #[derive(Clone)]
    struct StaleLookups(Database);

    impl RecordStore for StaleLookups {
        fn exists(&self, id: Uuid) -> crate::store::StoreResult<bool> {
            self.0.exists(id)
        }
        fn get(&self, id: Uuid) -> crate::store::StoreResult<Record> {
            self.0.get(id)
        }
        fn insert(&self, record: &Record) -> crate::store::StoreResult<()> {
            self.0.insert(record)
        }
        fn update(&self, record: &Record) -> crate::store::StoreResult<()> {
            self.0.update(record)
        }
        fn delete(
            &self,
            id: Uuid,
            at: chrono::DateTime<chrono::Utc>,
        ) -> crate::store::StoreResult<()> {
            self.0.delete(id, at)
        }
        fn remove(&self, id: Uuid) -> crate::store::StoreResult<bool> {
            self.0.remove(id)
        }
        fn all_for_account(
            &self,
            account: Uuid,
            include_deleted: bool,
        ) -> crate::store::StoreResult<Vec<Record>> {
            self.0.all_for_account(account, include_deleted)
        }
        fn purge_tombstones(
            &self,
            before: chrono::DateTime<chrono::Utc>,
        ) -> crate::store::StoreResult<usize> {
            self.0.purge_tombstones(before)
        }
    }

    impl LogStore for StaleLookups {
        fn logs_since(
            &self,
            since: chrono::DateTime<chrono::Utc>,
            account: Uuid,
        ) -> crate::store::StoreResult<Vec<crate::models::LogEntry>> {
            self.0.logs_since(since, account)
        }
        fn append(&self, entry: &crate::models::LogEntry) -> crate::store::StoreResult<bool> {
            self.0.append(entry)
        }
        fn get_watermark(
            &self,
            account: Uuid,
        ) -> crate::store::StoreResult<chrono::DateTime<chrono::Utc>> {
            self.0.get_watermark(account)
        }
        fn set_watermark(
            &self,
            account: Uuid,
            at: chrono::DateTime<chrono::Utc>,
        ) -> crate::store::StoreResult<()> {
            self.0.set_watermark(account, at)
        }
    }

    impl AccountStore for StaleLookups {
        fn account_exists(&self, _id: Uuid) -> crate::store::StoreResult<bool> {
            Ok(false)
        }
        fn get_account(&self, id: Uuid) -> crate::store::StoreResult<Account> {
            self.0.get_account(id)
        }
        fn find_by_token(&self, _token_hash: &[u8]) -> crate::store::StoreResult<Option<Account>> {
            Ok(None)
        }
        fn insert_account(&self, account: &Account) -> crate::store::StoreResult<()> {
            self.0.insert_account(account)
        }
        fn set_username(&self, id: Uuid, username: &[u8]) -> crate::store::StoreResult<()> {
            self.0.set_username(id, username)
        }
        fn accounts(&self) -> crate::store::StoreResult<Vec<Account>> {
            self.0.accounts()
        }
    }

    #[test]
    fn registration_race_reports_user_exists() {
        let store = StaleLookups(Database::in_memory().unwrap());
        let nusr = |id: Uuid| {
            let body = NewUserData {
                uuid: id.to_string(),
                token: vec![7; 32],
            }
            .encode()
            .unwrap();
            Payload::new(PayloadType::Nusr, body).unwrap()
        };

        let mut first = ServerSession::new(store.clone(), AccountLocks::new());
        let id = Uuid::new_v4();
        let reply = first.handle(&nusr(id)).reply.unwrap();
        assert_eq!(reply.kind(), PayloadType::Succ);

        for dup in [id, Uuid::new_v4()] {
            let mut second = ServerSession::new(store.clone(), AccountLocks::new());
            let reply = second.handle(&nusr(dup)).reply.unwrap();
            assert_eq!(reply.kind(), PayloadType::Fail);
            assert_eq!(reply.message(), FAIL_USER_EXISTS);
        }
    }
}
