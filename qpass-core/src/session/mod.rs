//! Session orchestration on top of the secure channel.
//!
//! The server side is a small state machine ([`ServerSession`]) fed one
//! payload at a time; [`serve`] drives it over a stream. The client side
//! ([`SyncClient`], [`run_sync_round`]) issues the fixed
//! PING, AUTH, SUSR, SYNC, SUCC sequence.

pub mod client;
pub mod server;

#[cfg(test)]
mod tests;

pub use client::{register_account, run_sync_round, RoundSummary, SyncClient};
pub use server::{serve, Outcome, ServerSession, SessionState};

use std::io;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::protocol::{CodecError, FrameError, PayloadType};
use crate::store::StoreError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("server refused request: {0}")]
    Rejected(String),

    #[error("expected {expected} reply, got {got}")]
    Unexpected {
        expected: PayloadType,
        got: PayloadType,
    },

    #[error("peer did not respond in time")]
    Timeout,
}

impl SessionError {
    /// The channel error underneath this one, if any, including one carried
    /// through the record layer as an `io::Error`.
    pub fn channel_error(&self) -> Option<&ChannelError> {
        match self {
            SessionError::Channel(err) => Some(err),
            SessionError::Frame(FrameError::Io(err)) | SessionError::Io(err) => {
                ChannelError::from_io(err)
            }
            _ => None,
        }
    }

    pub fn is_security(&self) -> bool {
        self.channel_error().map_or(false, ChannelError::is_security)
    }
}
