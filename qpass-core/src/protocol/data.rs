//! Structured payload bodies.
//!
//! Each body is a one-byte codec version followed by a bincode encoding with
//! fixed-width big-endian integers. Decoding is bounded by
//! [`MAX_PAYLOAD_SIZE`] so a hostile length prefix cannot drive allocation,
//! and trailing bytes are an error.

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{LogEntry, Record};
use crate::protocol::payload::MAX_PAYLOAD_SIZE;

pub const CODEC_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload body is truncated")]
    Truncated,
    #[error("unsupported codec version {0}")]
    UnsupportedVersion(u8),
    #[error("payload body exceeds the maximum payload size")]
    TooLarge,
    #[error("malformed payload body: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                CodecError::Truncated
            }
            bincode::ErrorKind::SizeLimit => CodecError::TooLarge,
            other => CodecError::Malformed(other.to_string()),
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
        .reject_trailing_bytes()
}

fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![CODEC_VERSION];
    out.extend(options().serialize(value)?);
    if out.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (&version, rest) = bytes.split_first().ok_or(CodecError::Truncated)?;
    if version != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(options().deserialize(rest)?)
}

/// Body of AUTH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: Vec<u8>,
}

/// Body of NUSR.
///
/// `uuid` travels as text; the server replaces an unparsable value with a
/// fresh id and reports the id it used back in SUCC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserData {
    pub uuid: String,
    pub token: Vec<u8>,
}

/// Body of SYNC and SUSR, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub last_sync: DateTime<Utc>,
    pub uuid: Uuid,
    pub logs: Vec<LogEntry>,
    pub records: Vec<Record>,
}

macro_rules! impl_codec {
    ($($ty:ty),+) => {
        $(
            impl $ty {
                pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
                    encode_body(self)
                }

                pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    decode_body(bytes)
                }
            }
        )+
    };
}

impl_codec!(AuthData, NewUserData, SyncData);

impl SyncData {
    pub fn with_records(uuid: Uuid, last_sync: DateTime<Utc>, records: Vec<Record>) -> Self {
        Self {
            last_sync,
            uuid,
            logs: Vec::new(),
            records,
        }
    }

    pub fn with_logs(uuid: Uuid, last_sync: DateTime<Utc>, logs: Vec<LogEntry>) -> Self {
        Self {
            last_sync,
            uuid,
            logs,
            records: Vec::new(),
        }
    }
}
