//! qpass sync server
//!
//! Accepts qpass clients over the secure channel and keeps every account's
//! sealed records and change log. The server never holds account keys or
//! plaintext.

mod cleanup;
mod config;
mod rate_limit;
mod server;

use clap::Parser;
use qpass_core::{ensure_data_dir, get_server_config_path, Database, ServerIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qpass-server", about = "qpass sync server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Key directory override
    #[arg(short, long)]
    key_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(get_server_config_path);

    let mut cfg = if config_path.exists() {
        config::ServerConfig::load(&config_path)?
    } else {
        tracing::info!("No config file at {}, using defaults", config_path.display());
        config::ServerConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.database_path = database;
    }
    if let Some(key_dir) = cli.key_dir {
        cfg.key_dir = key_dir;
    }

    ensure_data_dir()?;
    if let Some(parent) = cfg.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let key_dir = cfg.key_dir.clone();
    let bits = cfg.rsa_bits;
    // RSA generation on first start can take a while
    let identity =
        tokio::task::spawn_blocking(move || ServerIdentity::load_or_generate(&key_dir, bits))
            .await??;
    tracing::info!(
        "Server key fingerprint {}",
        qpass_core::channel::fingerprint(identity.public_key())
    );

    let store = Database::open(&cfg.database_path)?;
    let limiter = rate_limit::RateLimiter::new(cfg.handshakes_per_minute);
    cleanup::spawn_cleanup_task(
        store.clone(),
        limiter.clone(),
        cfg.tombstone_retention_days,
        Duration::from_secs(cfg.cleanup_interval_secs.max(1)),
    );

    let server = server::Server::bind(&cfg, Arc::new(identity), store, limiter).await?;
    tracing::info!("Starting qpass server on {}", server.local_addr()?);
    server.run().await
}
