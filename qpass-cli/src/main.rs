mod config;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use config::ClientConfig;
use qpass_core::models::PlainRecord;
use qpass_core::session::{register_account, run_sync_round, SyncClient};
use qpass_core::{
    find_account, get_client_config_path, Credentials, Database, FileKnownHosts, QpassError,
    Vault,
};
use rpassword::prompt_password;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

/// qpass - password manager with encrypted sync
#[derive(Parser)]
#[command(name = "qpass")]
#[command(about = "Password manager with an encrypted, synced vault", long_about = None)]
struct Cli {
    /// Path to the client configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account username (defaults to `default_username` from the config)
    #[arg(short, long, global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new account and register it with the server
    Register,

    /// Use an account that already exists on the server from this device
    Join,

    /// Add a new record
    Add {
        #[arg(long)]
        service: String,

        #[arg(long)]
        login: String,

        /// Secret (will prompt if not provided)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Change fields of an existing record
    Edit {
        id: Uuid,

        #[arg(long)]
        service: Option<String>,

        #[arg(long)]
        login: Option<String>,

        /// Prompt for a new secret
        #[arg(long)]
        secret: bool,
    },

    /// Delete a record
    Delete { id: Uuid },

    /// List all records
    List {
        /// Show secrets in plain text
        #[arg(long)]
        show_secrets: bool,
    },

    /// Search records by service or login
    Search { query: String },

    /// Run one sync round with the server
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(get_client_config_path);
    let cfg = ClientConfig::load_or_init(&config_path)?;
    let username = cli
        .username
        .or_else(|| cfg.default_username.clone())
        .ok_or_else(|| anyhow!("no username: pass --username or set default_username"))?;

    match cli.command {
        Commands::Register => report(&cfg, register(&cfg, &username).await),
        Commands::Join => report(&cfg, join(&cfg, &username).await),
        Commands::Add {
            service,
            login,
            secret,
        } => {
            let vault = unlock(&cfg, &username)?;
            let secret = match secret {
                Some(secret) => Zeroizing::new(secret),
                None => Zeroizing::new(prompt_password("Secret: ")?),
            };
            let id = vault.add_record(&PlainRecord::new(service, login, secret.as_str()))?;
            println!("Added {}", id);
            Ok(())
        }
        Commands::Edit {
            id,
            service,
            login,
            secret,
        } => {
            let vault = unlock(&cfg, &username)?;
            let mut record = vault.get_record(id)?;
            if let Some(service) = service {
                record.service = service;
            }
            if let Some(login) = login {
                record.login = login;
            }
            if secret {
                let new_secret = Zeroizing::new(prompt_password("New secret: ")?);
                replace_secret(&mut record, &new_secret);
            }
            let edited = vault.edit_record(id, &record);
            record.secret.zeroize();
            edited?;
            println!("Updated {}", id);
            Ok(())
        }
        Commands::Delete { id } => {
            let vault = unlock(&cfg, &username)?;
            vault.delete_record(id)?;
            println!("Deleted {}", id);
            Ok(())
        }
        Commands::List { show_secrets } => {
            let vault = unlock(&cfg, &username)?;
            print_records(&vault.list_records()?, show_secrets);
            Ok(())
        }
        Commands::Search { query } => {
            let vault = unlock(&cfg, &username)?;
            print_records(&vault.search(&query)?, false);
            Ok(())
        }
        Commands::Sync => {
            let vault = unlock(&cfg, &username)?;
            report(&cfg, sync(&cfg, &vault).await)
        }
    }
}

/// Point the user at known hosts when the server failed verification.
fn report(cfg: &ClientConfig, result: qpass_core::Result<()>) -> Result<()> {
    if let Err(e) = &result {
        if e.is_security() {
            eprintln!(
                "The server at {} failed verification. If its key was replaced on purpose, \
                 remove its line from {} and retry.",
                cfg.server_addr(),
                cfg.known_hosts_path.display()
            );
        }
    }
    Ok(result?)
}

fn open_store(cfg: &ClientConfig) -> qpass_core::Result<Database> {
    if let Some(parent) = cfg.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&cfg.database_path)?)
}

fn derive_credentials(
    cfg: &ClientConfig,
    username: &str,
    confirm: bool,
) -> qpass_core::Result<Credentials> {
    let password = Zeroizing::new(prompt_password("Password: ")?);
    if confirm {
        let again = Zeroizing::new(prompt_password("Confirm password: ")?);
        if *password != *again {
            return Err(QpassError::InvalidInput("passwords do not match".to_string()));
        }
    }
    Ok(Credentials::derive(username, &password, &cfg.account_kdf)?)
}

fn unlock(cfg: &ClientConfig, username: &str) -> qpass_core::Result<Vault<Database>> {
    let store = open_store(cfg)?;
    let credentials = derive_credentials(cfg, username, false)?;
    Ok(Vault::login(store, username, credentials)?)
}

async fn connect(cfg: &ClientConfig) -> qpass_core::Result<SyncClient<TcpStream>> {
    let hosts = FileKnownHosts::new(&cfg.known_hosts_path);
    let addr = cfg.server_addr();
    info!(%addr, "Connecting");
    Ok(SyncClient::connect(&addr, &hosts, &cfg.session_kdf, cfg.timeout()).await?)
}

async fn register(cfg: &ClientConfig, username: &str) -> qpass_core::Result<()> {
    let store = open_store(cfg)?;
    let credentials = derive_credentials(cfg, username, true)?;

    // re-running after a failed registration reuses the local account
    let vault = if find_account(&store, username, &credentials)?.is_some() {
        Vault::login(store, username, credentials)?
    } else {
        Vault::create_account(store, username, credentials)?
    };

    let account = vault.account_id();
    let stored = register_account(connect(cfg).await?, account, vault.auth_token()).await?;
    if stored != account {
        return Err(QpassError::InvalidInput(format!(
            "server stored the account as {} instead of {}",
            stored, account
        )));
    }
    println!("Registered account {}", account);
    sync(cfg, &vault).await
}

async fn join(cfg: &ClientConfig, username: &str) -> qpass_core::Result<()> {
    let store = open_store(cfg)?;
    let credentials = derive_credentials(cfg, username, false)?;
    if find_account(&store, username, &credentials)?.is_some() {
        return Err(QpassError::InvalidInput(format!(
            "account {} is already set up on this device",
            username
        )));
    }

    let mut client = connect(cfg).await?;
    client.ping().await?;
    let account = client.authenticate(credentials.token()).await?;
    client.finish().await?;

    let vault = Vault::adopt_account(store, account, username, credentials)?;
    println!("Joined account {}", account);
    sync(cfg, &vault).await
}

async fn sync(cfg: &ClientConfig, vault: &Vault<Database>) -> qpass_core::Result<()> {
    let account = vault.account_id();
    let summary =
        run_sync_round(connect(cfg).await?, vault.store(), account, vault.auth_token()).await?;
    info!(?summary, "Sync finished");
    println!(
        "Synced: sent {} changes and {} records; {} log entries and {} records updated locally",
        summary.logs_sent,
        summary.records_sent,
        summary.logs.appended,
        summary.records.changed()
    );
    Ok(())
}

/// Swap in `secret`, wiping the old one first.
fn replace_secret(record: &mut PlainRecord, secret: &str) {
    record.secret.zeroize();
    record.secret.push_str(secret);
}

fn print_records(records: &[(Uuid, PlainRecord)], show_secrets: bool) {
    if records.is_empty() {
        println!("No records");
        return;
    }
    for (id, record) in records {
        let secret = if show_secrets {
            record.secret.as_str()
        } else {
            "********"
        };
        println!("{}  {:<24} {:<24} {}", id, record.service, record.login, secret);
    }
}
