//! Server side of a session.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelError, SECURITY_TARGET};
use crate::crypto::{server_token_hash, tokens_match};
use crate::models::{now, Account};
use crate::protocol::{
    read_payload, write_payload, AuthData, CodecError, FrameError, NewUserData, Payload,
    PayloadType, SyncData,
};
use crate::session::SessionError;
use crate::store::{Store, StoreError};
use crate::sync::{merge_records, outgoing_logs, replay_logs, AccountLocks, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(Uuid),
    Closed,
}

/// What the connection loop should do after one payload.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Option<Payload>,
    pub close: bool,
}

impl Outcome {
    fn reply(payload: Payload) -> Self {
        Self {
            reply: Some(payload),
            close: false,
        }
    }

    fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

/// Why a request was answered with FAIL.
enum Refusal {
    /// Reported to the peer verbatim.
    Client(String),
    /// Logged locally; the peer only sees a generic reason.
    Internal(String),
}

impl Refusal {
    fn client(msg: impl Into<String>) -> Self {
        Refusal::Client(msg.into())
    }
}

impl From<CodecError> for Refusal {
    fn from(err: CodecError) -> Self {
        Refusal::Client(format!("malformed payload: {}", err))
    }
}

impl From<FrameError> for Refusal {
    fn from(err: FrameError) -> Self {
        Refusal::Internal(err.to_string())
    }
}

impl From<StoreError> for Refusal {
    fn from(err: StoreError) -> Self {
        Refusal::Internal(err.to_string())
    }
}

impl From<SyncError> for Refusal {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::ForeignRecord { .. } | SyncError::ForeignEntry { .. } => {
                Refusal::Client(err.to_string())
            }
            other => Refusal::Internal(other.to_string()),
        }
    }
}

pub const FAIL_NOT_AUTHENTICATED: &str = "not authenticated";
pub const FAIL_ALREADY_AUTHENTICATED: &str = "already authenticated";
pub const FAIL_AUTHENTICATION: &str = "authentication failed";
pub const FAIL_USER_EXISTS: &str = "user already exists";
pub const FAIL_UNKNOWN_ACCOUNT: &str = "unknown account";
pub const FAIL_UNEXPECTED: &str = "unexpected payload";
pub const FAIL_TOO_LARGE: &str = "reply exceeds the payload size limit";
pub const FAIL_INTERNAL: &str = "internal error";

/// Per-connection state machine.
pub struct ServerSession<S> {
    store: S,
    locks: AccountLocks,
    state: SessionState,
    staged_watermark: Option<DateTime<Utc>>,
}

impl<S: Store> ServerSession<S> {
    pub fn new(store: S, locks: AccountLocks) -> Self {
        Self {
            store,
            locks,
            state: SessionState::Unauthenticated,
            staged_watermark: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle one inbound payload.
    pub fn handle(&mut self, payload: &Payload) -> Outcome {
        if self.state == SessionState::Closed {
            return Outcome::close();
        }

        let result = match payload.kind() {
            PayloadType::Ping => Ok(Payload::pong()),
            PayloadType::Auth => self.handle_auth(payload.body()),
            PayloadType::Nusr => self.handle_new_user(payload.body()),
            PayloadType::Sync => self.handle_sync(payload.body()),
            PayloadType::Susr => self.handle_user_sync(payload.body()),
            PayloadType::Succ => return self.handle_success(),
            PayloadType::Pong | PayloadType::Fail | PayloadType::Spwd => {
                Err(Refusal::client(FAIL_UNEXPECTED))
            }
        };

        match result {
            Ok(reply) => Outcome::reply(reply),
            Err(Refusal::Client(msg)) => {
                debug!(kind = %payload.kind(), reason = %msg, "Refused request");
                Outcome::reply(Payload::fail(&msg))
            }
            Err(Refusal::Internal(msg)) => {
                error!(kind = %payload.kind(), error = %msg, "Request failed");
                Outcome::reply(Payload::fail(FAIL_INTERNAL))
            }
        }
    }

    fn authenticated(&self) -> Result<Uuid, Refusal> {
        match self.state {
            SessionState::Authenticated(account) => Ok(account),
            _ => Err(Refusal::client(FAIL_NOT_AUTHENTICATED)),
        }
    }

    fn handle_auth(&mut self, body: &[u8]) -> Result<Payload, Refusal> {
        // re-authentication on a live session is refused outright
        if let SessionState::Authenticated(_) = self.state {
            return Err(Refusal::client(FAIL_ALREADY_AUTHENTICATED));
        }

        let auth = AuthData::decode(body)?;
        let hash = server_token_hash(&auth.token);
        let account = match self.store.find_by_token(&hash)? {
            Some(account) => account,
            None => {
                warn!(target: SECURITY_TARGET, "Authentication failed: unknown token");
                return Err(Refusal::client(FAIL_AUTHENTICATION));
            }
        };

        let stored = account.auth_token.as_deref().unwrap_or_default();
        if !tokens_match(stored, &hash) {
            warn!(target: SECURITY_TARGET, account = %account.id, "Authentication failed");
            return Err(Refusal::client(FAIL_AUTHENTICATION));
        }

        info!(account = %account.id, "Authenticated");
        self.state = SessionState::Authenticated(account.id);
        Ok(Payload::succ_with_data(account.id.as_bytes().to_vec())?)
    }

    fn handle_new_user(&mut self, body: &[u8]) -> Result<Payload, Refusal> {
        let request = NewUserData::decode(body)?;
        let hash = server_token_hash(&request.token);

        let id = match Uuid::parse_str(&request.uuid) {
            Ok(id) => id,
            Err(_) => {
                let id = Uuid::new_v4();
                debug!(requested = %request.uuid, assigned = %id, "Replacing invalid account id");
                id
            }
        };

        if self.store.find_by_token(&hash)?.is_some() || self.store.account_exists(id)? {
            return Err(Refusal::client(FAIL_USER_EXISTS));
        }

        let inserted = self.store.insert_account(&Account {
            id,
            username: Vec::new(),
            auth_token: Some(hash.to_vec()),
        });
        match inserted {
            // lost a race with a concurrent registration
            Err(StoreError::Duplicate(_)) => return Err(Refusal::client(FAIL_USER_EXISTS)),
            other => other?,
        }
        info!(account = %id, "Registered account");
        Ok(Payload::succ_with_data(id.as_bytes().to_vec())?)
    }

    fn decode_sync(&self, body: &[u8]) -> Result<(Uuid, SyncData), Refusal> {
        let account = self.authenticated()?;
        let data = SyncData::decode(body)?;
        if data.uuid != account {
            return Err(Refusal::client(FAIL_UNKNOWN_ACCOUNT));
        }
        Ok((account, data))
    }

    fn handle_sync(&mut self, body: &[u8]) -> Result<Payload, Refusal> {
        let (account, data) = self.decode_sync(body)?;

        let (outcome, records) = self
            .locks
            .with_lock(account, || merge_records(&self.store, account, &data.records))?;
        debug!(%account, changed = outcome.changed(), total = records.len(), "SYNC merged");

        let reply = SyncData::with_records(account, now(), records);
        encode_reply(PayloadType::Sync, &reply)
    }

    fn handle_user_sync(&mut self, body: &[u8]) -> Result<Payload, Refusal> {
        let (account, data) = self.decode_sync(body)?;
        let started = now();

        let logs = self.locks.with_lock(account, || {
            // collect before replaying so the client's own entries are not echoed
            let outgoing = outgoing_logs(&self.store, account, data.last_sync)?;
            replay_logs(&self.store, account, &data.logs)?;
            Ok(outgoing)
        })?;
        debug!(%account, received = data.logs.len(), sent = logs.len(), "SUSR exchanged");

        self.staged_watermark = Some(started);
        let reply = SyncData::with_logs(account, started, logs);
        encode_reply(PayloadType::Susr, &reply)
    }

    fn handle_success(&mut self) -> Outcome {
        if let (SessionState::Authenticated(account), Some(at)) =
            (self.state, self.staged_watermark.take())
        {
            if let Err(err) = self.store.set_watermark(account, at) {
                error!(%account, error = %err, "Failed to record watermark");
            }
        }
        self.state = SessionState::Closed;
        Outcome::close()
    }
}

fn encode_reply(kind: PayloadType, data: &SyncData) -> Result<Payload, Refusal> {
    let body = match data.encode() {
        Ok(body) => body,
        Err(CodecError::TooLarge) => return Err(oversize(kind, data)),
        Err(e) => return Err(Refusal::Internal(format!("encoding {} reply: {}", kind, e))),
    };
    match Payload::new(kind, body) {
        Ok(payload) => Ok(payload),
        Err(FrameError::TooLarge { .. }) => Err(oversize(kind, data)),
        Err(e) => Err(e.into()),
    }
}

fn oversize(kind: PayloadType, data: &SyncData) -> Refusal {
    warn!(
        account = %data.uuid,
        %kind,
        records = data.records.len(),
        logs = data.logs.len(),
        "Reply does not fit in one payload"
    );
    Refusal::client(FAIL_TOO_LARGE)
}

/// Drive `session` over `stream` until SUCC, end of stream or an error.
///
/// Every read is bounded by `timeout`; a stalled peer gets disconnected.
pub async fn serve<S, T>(
    stream: &mut T,
    session: &mut ServerSession<S>,
    timeout: Duration,
) -> Result<(), SessionError>
where
    S: Store,
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = match tokio::time::timeout(timeout, read_payload(stream)).await {
            Err(_) => {
                debug!("Read timed out");
                return Err(SessionError::Timeout);
            }
            Ok(Err(err)) if err.is_eof() => {
                debug!("Peer closed connection");
                return Ok(());
            }
            Ok(Err(err)) => {
                if let FrameError::Io(io) = &err {
                    if let Some(channel) = ChannelError::from_io(io) {
                        if channel.is_security() {
                            warn!(target: SECURITY_TARGET, error = %channel, "Dropping connection");
                        }
                    }
                }
                return Err(err.into());
            }
            Ok(Ok(payload)) => payload,
        };

        debug!(kind = %payload.kind(), len = payload.body().len(), "Received payload");
        let outcome = session.handle(&payload);

        if let Some(reply) = &outcome.reply {
            tokio::time::timeout(timeout, write_payload(reply, stream))
                .await
                .map_err(|_| SessionError::Timeout)??;
        }
        if outcome.close {
            // peer may already be gone after SUCC
            let _ = stream.shutdown().await;
            return Ok(());
        }
    }
}
