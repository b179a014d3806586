//! idsync CLI
//!
//! Thin wrapper around idsync-core for inspecting and maintaining a client
//! store.
//!
//! ## Usage
//!
//! ```bash
//! # Show store summary
//! idsync info
//!
//! # List queued actions, optionally for one identity/service
//! idsync pending --identity alice@example.org --service profile
//!
//! # Show the sync cursor of a pair
//! idsync cursor alice@example.org profile
//!
//! # Show failed actions
//! idsync ledger --limit 20
//!
//! # Drop expired replay nonces now
//! idsync purge-replay
//!
//! # Generate a host keypair
//! idsync host-keygen --out host.key
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idsync_core::{
    ActionRecord, HostKeypair, Identity, JsonlErrorLedger, PairKey, ReplayGuard, Service, Storage,
    SyncConfig, SystemClock,
};

const STORE_FILE: &str = "idsync.redb";
const LEDGER_FILE: &str = "errors.jsonl";

/// idsync - offline-first identity graph sync
#[derive(Parser)]
#[command(name = "idsync")]
#[command(version)]
#[command(about = "Inspect and maintain an idsync client store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.idsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store summary
    Info,

    /// List queued actions in delivery order
    Pending {
        /// Only actions of this identity
        #[arg(long)]
        identity: Option<String>,
        /// Only actions on this service
        #[arg(long)]
        service: Option<String>,
    },

    /// Show the sync cursor of an identity/service pair
    Cursor {
        identity: String,
        service: String,
    },

    /// Show failed actions from the error ledger
    Ledger {
        /// Show only the most recent entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Drop replay nonces older than the retention period
    PurgeReplay,

    /// Generate a host keypair
    HostKeygen {
        /// Where to write the secret key (hex)
        #[arg(short, long)]
        out: PathBuf,
        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.idsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".idsync")
        .join("data")
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn open_storage(data_dir: &Path) -> Result<Storage> {
    let path = data_dir.join(STORE_FILE);
    tracing::debug!(path = %path.display(), "Opening store");
    Storage::new(&path).with_context(|| format!("Failed to open store {}", path.display()))
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => {
            let storage = open_storage(&data_dir)?;
            let pending = storage.all_pending()?;
            let cursors = storage.cursors()?;
            let ledger = JsonlErrorLedger::read_entries(data_dir.join(LEDGER_FILE))?;

            println!("idsync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Pending actions: {}", pending.len());
            println!("Synced pairs: {}", cursors.len());
            println!("Replay nonces: {}", storage.nonce_count()?);
            println!("Failed actions: {}", ledger.len());
            println!();
            println!("Workers: {}..{}", config.min_workers, config.max_workers);
            println!(
                "Backoff: {}ms..{}ms",
                config.initial_backoff_ms, config.max_backoff_ms
            );
            println!("Resend limit: {}", config.resend_limit);
        }

        Commands::Pending { identity, service } => {
            let storage = open_storage(&data_dir)?;
            let identity = identity.map(Identity::new);
            let service = service.map(Service::new);

            let records: Vec<_> = storage
                .all_pending()?
                .into_iter()
                .filter(|r| identity.as_ref().map_or(true, |i| &r.pair.identity == i))
                .filter(|r| service.as_ref().map_or(true, |s| &r.pair.service == s))
                .collect();

            if records.is_empty() {
                println!("No pending actions.");
            } else {
                println!("Pending actions ({}):", records.len());
                for pending in records {
                    match ActionRecord::decode(&pending.bytes) {
                        Ok(record) => println!(
                            "  {}  {}  {}  {}",
                            format_time(pending.time),
                            pending.pair,
                            record.type_tag,
                            record.id
                        ),
                        Err(e) => println!(
                            "  {}  {}  (unreadable: {})",
                            format_time(pending.time),
                            pending.pair,
                            e
                        ),
                    }
                }
            }
        }

        Commands::Cursor { identity, service } => {
            let storage = open_storage(&data_dir)?;
            let pair = PairKey::new(identity, service);
            match storage.cursor(&pair)? {
                Some(time) => println!("{}: {} ({})", pair, time, format_time(time)),
                None => println!("{}: never synced", pair),
            }
        }

        Commands::Ledger { limit } => {
            let entries = JsonlErrorLedger::read_entries(data_dir.join(LEDGER_FILE))?;
            if entries.is_empty() {
                println!("No failed actions.");
            } else {
                let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
                for entry in &entries[skip..] {
                    println!(
                        "{}  {}/{}  {}  {}  [{}] {}",
                        entry.ts,
                        entry.identity,
                        entry.service,
                        entry.action_type,
                        entry.action_id,
                        entry.kind,
                        entry.message
                    );
                }
            }
        }

        Commands::PurgeReplay => {
            let storage = open_storage(&data_dir)?;
            let guard = ReplayGuard::new(storage.clone(), Arc::new(SystemClock), &config);
            let purged = guard.purge()?;
            println!("Purged {} replay nonces ({} left)", purged, storage.nonce_count()?);
        }

        Commands::HostKeygen { out, force } => {
            if out.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to replace it",
                    out.display()
                );
            }
            let keypair = HostKeypair::generate()?;
            std::fs::write(&out, hex::encode(keypair.to_bytes()))
                .with_context(|| format!("Failed to write {}", out.display()))?;

            let public = keypair.public_keys();
            println!("Host key written to {}", out.display());
            println!("  Signing key:  {}", hex::encode(public.signing));
            println!("  Exchange key: {}", hex::encode(public.exchange));
        }
    }

    Ok(())
}
