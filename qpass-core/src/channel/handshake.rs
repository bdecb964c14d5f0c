//! Channel handshake.
//!
//! ```text
//! client -> server   client_pub(32)
//! server -> client   server_pub(32)
//!                    len:2 || PKCS#1 DER public key
//!                    len:2 || RSA-PSS signature over transcript
//!                    len:2 || seal(session_key, transcript || signature)
//! ```
//!
//! `transcript = client_pub || server_pub || der` and
//! `session_key = Argon2id(shared, salt = client_pub || server_pub)`.

use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::channel::identity::{self, ServerIdentity};
use crate::channel::{fingerprint, ChannelError, KnownHosts, SecureChannel, SECURITY_TARGET};
use crate::crypto::{cipher, kdf, KdfParams, SecretKey};

/// Upper bound for any length-prefixed handshake field.
pub const MAX_HANDSHAKE_FIELD: usize = 8 * 1024;

const KEY_LEN: usize = 32;

fn transcript(client_pub: &[u8; KEY_LEN], server_pub: &[u8; KEY_LEN], der: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * KEY_LEN + der.len());
    out.extend_from_slice(client_pub);
    out.extend_from_slice(server_pub);
    out.extend_from_slice(der);
    out
}

fn mac_input(transcript: &[u8], signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(transcript.len() + signature.len());
    out.extend_from_slice(transcript);
    out.extend_from_slice(signature);
    out
}

fn push_field(out: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), ChannelError> {
    if bytes.len() > MAX_HANDSHAKE_FIELD {
        return Err(ChannelError::FieldTooLong {
            field,
            len: bytes.len(),
        });
    }
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

async fn read_field<S>(stream: &mut S, field: &'static str) -> Result<Vec<u8>, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let len = u16::from_be_bytes(len) as usize;
    if len > MAX_HANDSHAKE_FIELD {
        return Err(ChannelError::FieldTooLong { field, len });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Argon2id over the shared secret, run on the blocking pool.
async fn derive_session_key(
    shared: Zeroizing<[u8; KEY_LEN]>,
    client_pub: [u8; KEY_LEN],
    server_pub: [u8; KEY_LEN],
    params: KdfParams,
) -> Result<SecretKey, ChannelError> {
    let key = tokio::task::spawn_blocking(move || {
        let mut salt = [0u8; 2 * KEY_LEN];
        salt[..KEY_LEN].copy_from_slice(&client_pub);
        salt[KEY_LEN..].copy_from_slice(&server_pub);
        kdf::derive_key(shared.as_ref(), &salt, &params)
    })
    .await
    .map_err(|e| ChannelError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    Ok(key)
}

fn agree(
    secret: EphemeralSecret,
    peer: [u8; KEY_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, ChannelError> {
    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(ChannelError::NonContributory);
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

/// Run the client side of the handshake over `stream`.
///
/// `addr` keys the known-hosts lookup. A first-contact key is pinned only
/// after the signature and the session MAC both verify.
pub async fn client_handshake<S>(
    mut stream: S,
    addr: &str,
    known_hosts: &dyn KnownHosts,
    params: &KdfParams,
) -> Result<SecureChannel<S>, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let client_pub = PublicKey::from(&secret).to_bytes();
    stream.write_all(&client_pub).await?;
    stream.flush().await?;

    let mut server_pub = [0u8; KEY_LEN];
    stream.read_exact(&mut server_pub).await?;
    let der = read_field(&mut stream, "public key").await?;
    let signature = read_field(&mut stream, "signature").await?;
    let mac = read_field(&mut stream, "mac").await?;

    let server_key = RsaPublicKey::from_pkcs1_der(&der)
        .map_err(|e| ChannelError::InvalidServerKey(e.to_string()))?;

    let pinned = known_hosts.lookup(addr)?;
    if let Some(pinned) = &pinned {
        if pinned != &server_key {
            warn!(
                target: SECURITY_TARGET,
                addr,
                pinned = %fingerprint(pinned),
                presented = %fingerprint(&server_key),
                "Server key does not match known hosts"
            );
            return Err(ChannelError::TrustMismatch {
                addr: addr.to_string(),
            });
        }
    }

    let transcript = transcript(&client_pub, &server_pub, &der);
    identity::verify(&server_key, &transcript, &signature)?;

    let shared = agree(secret, server_pub)?;
    let session_key = derive_session_key(shared, client_pub, server_pub, params.clone()).await?;

    let expected = mac_input(&transcript, &signature);
    let confirmed = cipher::open(&session_key, &mac).map_err(|_| ChannelError::MacMismatch)?;
    if !bool::from(confirmed.ct_eq(&expected)) {
        return Err(ChannelError::MacMismatch);
    }

    if pinned.is_none() {
        known_hosts.pin(addr, &server_key)?;
        info!(addr, fingerprint = %fingerprint(&server_key), "Trusting new server key");
    }

    debug!(addr, "Client handshake complete");
    Ok(SecureChannel::new(stream, session_key))
}

/// Run the server side of the handshake over `stream`.
pub async fn server_handshake<S>(
    mut stream: S,
    identity: &ServerIdentity,
    params: &KdfParams,
) -> Result<SecureChannel<S>, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_pub = [0u8; KEY_LEN];
    stream.read_exact(&mut client_pub).await?;

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let server_pub = PublicKey::from(&secret).to_bytes();
    let shared = agree(secret, client_pub)?;
    let session_key = derive_session_key(shared, client_pub, server_pub, params.clone()).await?;

    let der = identity.public_der();
    let transcript = transcript(&client_pub, &server_pub, der);
    let signature = identity.sign(&transcript);
    let mac = cipher::seal(&session_key, &mac_input(&transcript, &signature))?;

    let mut hello = Vec::with_capacity(KEY_LEN + 6 + der.len() + signature.len() + mac.len());
    hello.extend_from_slice(&server_pub);
    push_field(&mut hello, "public key", der)?;
    push_field(&mut hello, "signature", &signature)?;
    push_field(&mut hello, "mac", &mac)?;
    stream.write_all(&hello).await?;
    stream.flush().await?;

    debug!("Server handshake complete");
    Ok(SecureChannel::new(stream, session_key))
}
