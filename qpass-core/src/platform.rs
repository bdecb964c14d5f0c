//! Default on-disk locations for the client and the server.

use std::path::PathBuf;

const APP_DIR: &str = "qpass";

/// Platform data directory for qpass
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\qpass
/// - macOS: ~/Library/Application Support/qpass
/// - Linux/Other: ~/.local/share/qpass
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Platform config directory for qpass
///
/// Returns:
/// - Windows: %APPDATA%\qpass
/// - macOS: ~/Library/Application Support/qpass
/// - Linux/Other: ~/.config/qpass
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Client vault database
pub fn get_default_vault_path() -> PathBuf {
    get_data_dir().join("vault.db")
}

/// Server database
pub fn get_default_server_db_path() -> PathBuf {
    get_data_dir().join("server.db")
}

/// Directory holding the server's `key.rsa` / `key.rsa.pub`
pub fn get_default_key_dir() -> PathBuf {
    get_data_dir().join("keys")
}

pub fn get_known_hosts_path() -> PathBuf {
    get_config_dir().join("known_hosts")
}

pub fn get_client_config_path() -> PathBuf {
    get_config_dir().join("client.toml")
}

pub fn get_server_config_path() -> PathBuf {
    get_config_dir().join("server.toml")
}

/// Ensure the data directory exists, creating it if necessary
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Ensure the config directory exists, creating it if necessary
pub fn ensure_config_dir() -> std::io::Result<PathBuf> {
    let dir = get_config_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_namespaced() {
        assert!(get_data_dir().ends_with(APP_DIR));
        assert!(get_config_dir().ends_with(APP_DIR));
    }

    #[test]
    fn test_default_paths() {
        assert!(get_default_vault_path().ends_with("vault.db"));
        assert!(get_default_server_db_path().ends_with("server.db"));
        assert!(get_known_hosts_path().starts_with(get_config_dir()));
        assert!(get_default_key_dir().starts_with(get_data_dir()));
        assert_ne!(get_client_config_path(), get_server_config_path());
    }
}
