//! TCP accept loop. Each connection gets its own task: handshake, then the
//! session state machine until SUCC, EOF, an error or a stalled read.

use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use qpass_core::channel::{server_handshake, SECURITY_TARGET};
use qpass_core::session::{serve, ServerSession, SessionError};
use qpass_core::{AccountLocks, Database, KdfParams, ServerIdentity};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// State shared by every connection task.
struct Shared {
    identity: Arc<ServerIdentity>,
    store: Database,
    locks: AccountLocks,
    session_kdf: KdfParams,
    read_timeout: Duration,
    limiter: RateLimiter,
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        identity: Arc<ServerIdentity>,
        store: Database,
        limiter: RateLimiter,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                identity,
                store,
                locks: AccountLocks::new(),
                session_kdf: config.session_kdf.clone(),
                read_timeout: config.read_timeout(),
                limiter,
            }),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            // wait for a free slot before accepting so the backlog absorbs bursts
            let permit = self.permits.clone().acquire_owned().await?;
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            if !self.shared.limiter.check(peer.ip()) {
                warn!(target: SECURITY_TARGET, %peer, "Handshake rate limit exceeded");
                continue;
            }

            let shared = self.shared.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handle_connection(stream, peer, &shared).await;
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: &Shared) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {}", e);
    }
    info!(%peer, "Connection accepted");

    let result = async {
        let mut channel = tokio::time::timeout(
            shared.read_timeout,
            server_handshake(stream, &shared.identity, &shared.session_kdf),
        )
        .await
        .map_err(|_| SessionError::Timeout)??;

        let mut session = ServerSession::new(shared.store.clone(), shared.locks.clone());
        serve(&mut channel, &mut session, shared.read_timeout).await
    }
    .await;

    match result {
        Ok(()) => info!(%peer, "Connection closed"),
        Err(e) if e.is_security() => {
            warn!(target: SECURITY_TARGET, %peer, "Connection aborted: {}", e)
        }
        Err(e) => info!(%peer, "Connection ended: {}", e),
    }
}
