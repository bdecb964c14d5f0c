//! Trust-on-first-use store for server long-term keys.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::channel::ChannelError;

/// Maps a remote address to the long-term key first seen there.
///
/// A pinned key is never replaced; pinning a different key for a known
/// address is a [`ChannelError::TrustMismatch`].
pub trait KnownHosts: Send + Sync {
    fn lookup(&self, addr: &str) -> Result<Option<RsaPublicKey>, ChannelError>;
    fn pin(&self, addr: &str, key: &RsaPublicKey) -> Result<(), ChannelError>;
}

/// Short printable fingerprint of a server key, for log lines.
pub fn fingerprint(key: &RsaPublicKey) -> String {
    match key.to_pkcs1_der() {
        Ok(der) => hex::encode(&Sha256::digest(der.as_bytes())[..8]),
        Err(_) => "unencodable".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryKnownHosts {
    hosts: Mutex<HashMap<String, RsaPublicKey>>,
}

impl MemoryKnownHosts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnownHosts for MemoryKnownHosts {
    fn lookup(&self, addr: &str) -> Result<Option<RsaPublicKey>, ChannelError> {
        let hosts = self
            .hosts
            .lock()
            .map_err(|_| ChannelError::KnownHosts("lock poisoned".to_string()))?;
        Ok(hosts.get(addr).cloned())
    }

    fn pin(&self, addr: &str, key: &RsaPublicKey) -> Result<(), ChannelError> {
        let mut hosts = self
            .hosts
            .lock()
            .map_err(|_| ChannelError::KnownHosts("lock poisoned".to_string()))?;
        match hosts.get(addr) {
            Some(existing) if existing != key => Err(ChannelError::TrustMismatch {
                addr: addr.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                hosts.insert(addr.to_string(), key.clone());
                Ok(())
            }
        }
    }
}

/// Known hosts kept in a text file, one `<addr> <base64 PKCS#1 DER>` per line.
pub struct FileKnownHosts {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, RsaPublicKey>, ChannelError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(ChannelError::KnownHosts(e.to_string())),
        };

        let mut hosts = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                // first entry for an address wins
                Some((addr, key)) => {
                    hosts.entry(addr).or_insert(key);
                }
                None => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    "Skipping malformed known hosts line"
                ),
            }
        }
        Ok(hosts)
    }
}

fn parse_line(line: &str) -> Option<(String, RsaPublicKey)> {
    let (addr, encoded) = line.split_once(char::is_whitespace)?;
    let der = STANDARD.decode(encoded.trim()).ok()?;
    let key = RsaPublicKey::from_pkcs1_der(&der).ok()?;
    Some((addr.to_string(), key))
}

impl KnownHosts for FileKnownHosts {
    fn lookup(&self, addr: &str) -> Result<Option<RsaPublicKey>, ChannelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ChannelError::KnownHosts("lock poisoned".to_string()))?;
        Ok(self.read_all()?.remove(addr))
    }

    fn pin(&self, addr: &str, key: &RsaPublicKey) -> Result<(), ChannelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ChannelError::KnownHosts("lock poisoned".to_string()))?;

        if let Some(existing) = self.read_all()?.get(addr) {
            if existing != key {
                return Err(ChannelError::TrustMismatch {
                    addr: addr.to_string(),
                });
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| ChannelError::KnownHosts(e.to_string()))?;
            }
        }

        let der = key
            .to_pkcs1_der()
            .map_err(|e| ChannelError::KnownHosts(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ChannelError::KnownHosts(e.to_string()))?;
        writeln!(file, "{} {}", addr, STANDARD.encode(der.as_bytes()))
            .map_err(|e| ChannelError::KnownHosts(e.to_string()))?;

        debug!(addr, fingerprint = %fingerprint(key), "Pinned server key");
        Ok(())
    }
}
