//! Post-handshake record layer.
//!
//! Record layout: `[length:4 BE][nonce(12) || ciphertext || tag(16)]`.
//! One `poll_write` call becomes exactly one record; there is no chunking,
//! so callers must keep each write under [`MAX_RECORD_PLAINTEXT`].
//! Decrypted bytes go into a FIFO so readers may ask for less than a record.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::channel::ChannelError;
use crate::crypto::{cipher, SecretKey, MIN_SEALED_LEN};

pub const MAX_RECORD_PLAINTEXT: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;
const MAX_RECORD_LEN: usize = MAX_RECORD_PLAINTEXT + MIN_SEALED_LEN;

enum ReadState {
    Header { buf: [u8; LEN_PREFIX], filled: usize },
    Body { buf: Vec<u8>, filled: usize },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            buf: [0; LEN_PREFIX],
            filled: 0,
        }
    }
}

/// An encrypted duplex stream over `S`.
pub struct SecureChannel<S> {
    inner: S,
    key: SecretKey,
    read_state: ReadState,
    plaintext: VecDeque<u8>,
    pending: Vec<u8>,
    written: usize,
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel").finish_non_exhaustive()
    }
}

impl<S> SecureChannel<S> {
    pub(crate) fn new(inner: S, key: SecretKey) -> Self {
        Self {
            inner,
            key,
            read_state: ReadState::header(),
            plaintext: VecDeque::new(),
            pending: Vec::new(),
            written: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    #[cfg(test)]
    pub(crate) fn session_key(&self) -> &SecretKey {
        &self.key
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    /// Pull one whole record into the plaintext queue.
    ///
    /// Resolves to `false` on a clean end of stream at a record boundary.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        loop {
            match &mut self.read_state {
                ReadState::Header { buf, filled } => {
                    while *filled < LEN_PREFIX {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            if *filled == 0 {
                                return Poll::Ready(Ok(false));
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }

                    let len = u32::from_be_bytes(*buf) as usize;
                    if len < MIN_SEALED_LEN {
                        return Poll::Ready(Err(ChannelError::RecordAuthentication.into_io()));
                    }
                    if len > MAX_RECORD_LEN {
                        return Poll::Ready(Err(ChannelError::RecordTooLarge {
                            max: MAX_RECORD_LEN,
                            got: len,
                        }
                        .into_io()));
                    }
                    self.read_state = ReadState::Body {
                        buf: vec![0; len],
                        filled: 0,
                    };
                }
                ReadState::Body { buf, filled } => {
                    while *filled < buf.len() {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }

                    let sealed = std::mem::take(buf);
                    self.read_state = ReadState::header();
                    let plain = cipher::open(&self.key, &sealed)
                        .map_err(|_| ChannelError::RecordAuthentication.into_io())?;
                    self.plaintext.extend(plain);
                    return Poll::Ready(Ok(true));
                }
            }
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureChannel<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        while this.plaintext.is_empty() {
            if !ready!(this.poll_fill(cx))? {
                return Poll::Ready(Ok(()));
            }
        }

        let n = buf.remaining().min(this.plaintext.len());
        let chunk: Vec<u8> = this.plaintext.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureChannel<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if data.len() > MAX_RECORD_PLAINTEXT {
            return Poll::Ready(Err(ChannelError::RecordTooLarge {
                max: MAX_RECORD_PLAINTEXT,
                got: data.len(),
            }
            .into_io()));
        }

        let sealed = cipher::seal(&this.key, data).map_err(|e| ChannelError::Crypto(e).into_io())?;
        this.pending
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        this.pending.extend_from_slice(&sealed);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
