//! Client configuration, kept as TOML in the platform config directory.

use anyhow::Context;
use qpass_core::platform::{get_default_vault_path, get_known_hosts_path};
use qpass_core::KdfParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    /// Used when `--username` is not given.
    pub default_username: Option<String>,
    pub database_path: PathBuf,
    pub known_hosts_path: PathBuf,
    /// Must be identical on every device of an account.
    pub account_kdf: KdfParams,
    /// Must match the server's `session_kdf`.
    pub session_kdf: KdfParams,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 1717,
            default_username: None,
            database_path: get_default_vault_path(),
            known_hosts_path: get_known_hosts_path(),
            account_kdf: KdfParams::interactive(),
            session_kdf: KdfParams::interactive(),
            timeout_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.account_kdf.validate()?;
        config.session_kdf.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        tracing::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    /// `host:port`, also the key used in known hosts.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
