//! Server configuration.

use qpass_core::platform::{get_default_key_dir, get_default_server_db_path};
use qpass_core::KdfParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// Holds `key.rsa` and `key.rsa.pub`; generated on first start.
    pub key_dir: PathBuf,
    pub rsa_bits: usize,
    /// Must match the clients' session KDF or every handshake fails.
    pub session_kdf: KdfParams,
    pub read_timeout_secs: u64,
    pub max_connections: usize,
    /// Handshakes accepted per peer address per minute.
    pub handshakes_per_minute: u32,
    pub tombstone_retention_days: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1717".to_string(),
            database_path: get_default_server_db_path(),
            key_dir: get_default_key_dir(),
            rsa_bits: 4096,
            session_kdf: KdfParams::interactive(),
            read_timeout_secs: 30,
            max_connections: 64,
            handshakes_per_minute: 30,
            tombstone_retention_days: 90,
            cleanup_interval_secs: 3600,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        config.session_kdf.validate()?;
        if crate::cleanup::retention_cutoff(config.tombstone_retention_days).is_none() {
            anyhow::bail!(
                "tombstone_retention_days = {} is out of range",
                config.tombstone_retention_days
            );
        }
        Ok(config)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = \"0.0.0.0:9000\"").unwrap();
        writeln!(file, "max_connections = 8").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.rsa_bits, 4096);
        assert_eq!(config.tombstone_retention_days, 90);
        assert_eq!(config.session_kdf, KdfParams::interactive());
    }

    #[test]
    fn kdf_table_is_validated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session_kdf]").unwrap();
        writeln!(file, "mem_cost = 1024").unwrap();
        writeln!(file, "time_cost = 0").unwrap();
        writeln!(file, "parallelism = 1").unwrap();
        writeln!(file, "output_length = 32").unwrap();

        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn out_of_range_retention_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tombstone_retention_days = 1000000000").unwrap();
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr = [").unwrap();
        assert!(ServerConfig::load(file.path()).is_err());
    }
}
