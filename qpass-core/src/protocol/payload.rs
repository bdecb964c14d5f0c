//! Typed, length-prefixed envelopes.
//!
//! Layout on the wire: `[type:1][length:2 BE][body:length]`. The declared
//! length is checked against [`MAX_PAYLOAD_SIZE`] before any body buffer is
//! allocated, and reads always fill the full header and body or fail.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest body a single envelope may carry.
pub const MAX_PAYLOAD_SIZE: usize = 50 * 1024;

pub const HEADER_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    Ping = 0,
    Pong = 1,
    Auth = 2,
    Sync = 3,
    Susr = 4,
    /// Reserved; never sent by this implementation.
    Spwd = 5,
    Succ = 6,
    Fail = 7,
    Nusr = 8,
}

impl PayloadType {
    pub fn name(&self) -> &'static str {
        match self {
            PayloadType::Ping => "PING",
            PayloadType::Pong => "PONG",
            PayloadType::Auth => "AUTH",
            PayloadType::Sync => "SYNC",
            PayloadType::Susr => "SUSR",
            PayloadType::Spwd => "SPWD",
            PayloadType::Succ => "SUCC",
            PayloadType::Fail => "FAIL",
            PayloadType::Nusr => "NUSR",
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PayloadType::Ping,
            1 => PayloadType::Pong,
            2 => PayloadType::Auth,
            3 => PayloadType::Sync,
            4 => PayloadType::Susr,
            5 => PayloadType::Spwd,
            6 => PayloadType::Succ,
            7 => PayloadType::Fail,
            8 => PayloadType::Nusr,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("payload too large: max {max} bytes, got {got}")]
    TooLarge { max: usize, got: usize },
    #[error("unknown payload type {0}")]
    UnknownType(u8),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

impl FrameError {
    /// True when the peer closed the stream before a new envelope began.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// One envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    kind: PayloadType,
    body: Vec<u8>,
}

impl Payload {
    pub fn new(kind: PayloadType, body: Vec<u8>) -> Result<Self, FrameError> {
        if body.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::TooLarge {
                max: MAX_PAYLOAD_SIZE,
                got: body.len(),
            });
        }
        Ok(Self { kind, body })
    }

    pub fn ping() -> Self {
        Self::empty(PayloadType::Ping)
    }

    pub fn pong() -> Self {
        Self::empty(PayloadType::Pong)
    }

    pub fn succ() -> Self {
        Self::empty(PayloadType::Succ)
    }

    pub fn succ_with_data(data: Vec<u8>) -> Result<Self, FrameError> {
        Self::new(PayloadType::Succ, data)
    }

    /// FAIL carrying a human-readable reason. Overlong reasons are cut at a
    /// character boundary so the envelope always fits.
    pub fn fail(reason: &str) -> Self {
        let mut end = reason.len().min(MAX_PAYLOAD_SIZE);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            kind: PayloadType::Fail,
            body: reason.as_bytes()[..end].to_vec(),
        }
    }

    fn empty(kind: PayloadType) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    pub fn kind(&self) -> PayloadType {
        self.kind
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Body rendered as text; used for FAIL reasons.
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Encode header and body into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.push(self.kind as u8);
        // body length is capped at MAX_PAYLOAD_SIZE, which fits in u16
        buf.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode exactly one envelope from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(truncated());
        }
        let (kind, len) = parse_header([buf[0], buf[1], buf[2]])?;
        let rest = &buf[HEADER_LEN..];
        if rest.len() < len {
            return Err(truncated());
        }
        if rest.len() > len {
            return Err(FrameError::TrailingBytes(rest.len() - len));
        }
        Ok(Self {
            kind,
            body: rest.to_vec(),
        })
    }
}

fn truncated() -> FrameError {
    FrameError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "truncated payload",
    ))
}

fn parse_header(header: [u8; HEADER_LEN]) -> Result<(PayloadType, usize), FrameError> {
    let kind = PayloadType::try_from(header[0])?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::TooLarge {
            max: MAX_PAYLOAD_SIZE,
            got: len,
        });
    }
    Ok((kind, len))
}

/// Read one envelope, waiting until it is complete.
pub async fn read_payload<R>(reader: &mut R) -> Result<Payload, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (kind, len) = parse_header(header)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Payload { kind, body })
}

/// Write one envelope as a single buffer and flush.
pub async fn write_payload<W>(payload: &Payload, writer: &mut W) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&payload.encode()).await?;
    writer.flush().await?;
    Ok(())
}
