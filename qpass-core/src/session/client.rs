//! Client side of a session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{client_handshake, KnownHosts, SecureChannel};
use crate::crypto::KdfParams;
use crate::models::{now, LogEntry, Record};
use crate::protocol::{
    read_payload, write_payload, AuthData, NewUserData, Payload, PayloadType, SyncData,
};
use crate::session::SessionError;
use crate::store::Store;
use crate::sync::{apply_remote_records, outgoing_logs, replay_logs, MergeOutcome, ReplayOutcome};

pub struct SyncClient<S> {
    channel: SecureChannel<S>,
    timeout: Duration,
}

impl SyncClient<TcpStream> {
    /// Dial `addr` and complete the handshake.
    pub async fn connect(
        addr: &str,
        known_hosts: &dyn KnownHosts,
        kdf: &KdfParams,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout)??;
        stream.set_nodelay(true)?;
        Self::connect_stream(stream, addr, known_hosts, kdf, timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SyncClient<S> {
    /// Complete the handshake over an already-open stream. `addr` keys the
    /// known-hosts entry.
    pub async fn connect_stream(
        stream: S,
        addr: &str,
        known_hosts: &dyn KnownHosts,
        kdf: &KdfParams,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let channel = tokio::time::timeout(timeout, client_handshake(stream, addr, known_hosts, kdf))
            .await
            .map_err(|_| SessionError::Timeout)??;
        Ok(Self { channel, timeout })
    }

    /// Send `request` and wait for the reply. FAIL becomes
    /// [`SessionError::Rejected`]; any other kind than `expected` is an error.
    async fn exchange(
        &mut self,
        request: Payload,
        expected: PayloadType,
    ) -> Result<Payload, SessionError> {
        let timeout = self.timeout;
        let reply = tokio::time::timeout(timeout, async {
            write_payload(&request, &mut self.channel).await?;
            read_payload(&mut self.channel).await
        })
        .await
        .map_err(|_| SessionError::Timeout)??;

        debug!(sent = %request.kind(), received = %reply.kind(), "Exchange complete");
        match reply.kind() {
            kind if kind == expected => Ok(reply),
            PayloadType::Fail => Err(SessionError::Rejected(reply.message())),
            got => Err(SessionError::Unexpected { expected, got }),
        }
    }

    pub async fn ping(&mut self) -> Result<(), SessionError> {
        self.exchange(Payload::ping(), PayloadType::Pong).await?;
        Ok(())
    }

    /// AUTH with `token`. Returns the account id the server bound the
    /// session to.
    pub async fn authenticate(&mut self, token: &[u8]) -> Result<Uuid, SessionError> {
        let body = AuthData {
            token: token.to_vec(),
        }
        .encode()?;
        let reply = self
            .exchange(Payload::new(PayloadType::Auth, body)?, PayloadType::Succ)
            .await?;
        account_from_reply(&reply)
    }

    /// NUSR: register `account` under `token`. Returns the id the server
    /// stored, which differs from `account` only if the server replaced it.
    pub async fn register(&mut self, account: Uuid, token: &[u8]) -> Result<Uuid, SessionError> {
        let body = NewUserData {
            uuid: account.to_string(),
            token: token.to_vec(),
        }
        .encode()?;
        let reply = self
            .exchange(Payload::new(PayloadType::Nusr, body)?, PayloadType::Succ)
            .await?;
        account_from_reply(&reply)
    }

    /// SYNC: push `records`, receive the server's full set for `account`.
    pub async fn sync_records(
        &mut self,
        account: Uuid,
        records: Vec<Record>,
        last_sync: DateTime<Utc>,
    ) -> Result<Vec<Record>, SessionError> {
        let body = SyncData::with_records(account, last_sync, records).encode()?;
        let reply = self
            .exchange(Payload::new(PayloadType::Sync, body)?, PayloadType::Sync)
            .await?;
        Ok(SyncData::decode(reply.body())?.records)
    }

    /// SUSR: push log entries, receive the server's entries since `last_sync`.
    pub async fn sync_logs(
        &mut self,
        account: Uuid,
        logs: Vec<LogEntry>,
        last_sync: DateTime<Utc>,
    ) -> Result<SyncData, SessionError> {
        let body = SyncData::with_logs(account, last_sync, logs).encode()?;
        let reply = self
            .exchange(Payload::new(PayloadType::Susr, body)?, PayloadType::Susr)
            .await?;
        Ok(SyncData::decode(reply.body())?)
    }

    /// Send SUCC and close the stream.
    pub async fn finish(mut self) -> Result<(), SessionError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, async {
            write_payload(&Payload::succ(), &mut self.channel).await?;
            self.channel.shutdown().await?;
            Ok::<_, SessionError>(())
        })
        .await
        .map_err(|_| SessionError::Timeout)?
    }
}

fn account_from_reply(reply: &Payload) -> Result<Uuid, SessionError> {
    Uuid::from_slice(reply.body())
        .map_err(|_| SessionError::Rejected("server sent a malformed account id".to_string()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub logs_sent: usize,
    pub logs: ReplayOutcome,
    pub records_sent: usize,
    pub records: MergeOutcome,
}

/// One full sync round for `account`: PING, AUTH, SUSR, SYNC, SUCC.
///
/// The local watermark moves to the round's start time only after every
/// step, SUCC included, has gone through. Any failure leaves it where it
/// was, so the next round resends the same window.
pub async fn run_sync_round<T, S>(
    mut client: SyncClient<T>,
    store: &S,
    account: Uuid,
    token: &[u8],
) -> Result<RoundSummary, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Store + ?Sized,
{
    let started = now();
    let watermark = store.get_watermark(account)?;

    client.ping().await?;
    let bound = client.authenticate(token).await?;
    if bound != account {
        return Err(SessionError::Rejected(format!(
            "server authenticated account {} instead of {}",
            bound, account
        )));
    }

    let outgoing = outgoing_logs(store, account, watermark)?;
    let logs_sent = outgoing.len();
    let reply = client.sync_logs(account, outgoing, watermark).await?;
    let logs = replay_logs(store, account, &reply.logs)?;

    let changed: Vec<Record> = store
        .all_for_account(account, true)?
        .into_iter()
        .filter(|r| r.last_changed > watermark)
        .collect();
    let records_sent = changed.len();
    let remote = client.sync_records(account, changed, watermark).await?;
    let records = apply_remote_records(store, account, &remote)?;

    client.finish().await?;
    store.set_watermark(account, started)?;

    info!(
        %account,
        logs_sent,
        logs_received = reply.logs.len(),
        records_sent,
        records_changed = records.changed(),
        "Sync round complete"
    );
    Ok(RoundSummary {
        logs_sent,
        logs,
        records_sent,
        records,
    })
}

/// First-time registration: PING, NUSR, SUCC. Returns the id the server
/// stored the account under.
pub async fn register_account<T>(
    mut client: SyncClient<T>,
    account: Uuid,
    token: &[u8],
) -> Result<Uuid, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    client.ping().await?;
    let id = client.register(account, token).await?;
    client.finish().await?;
    info!(account = %id, "Account registered with server");
    Ok(id)
}
