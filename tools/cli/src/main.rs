//! DualStore CLI - Command line interface for the offline journal.
//!
//! Inspects, resets and repairs the pending-change journal of a data
//! directory, and replays queued changes against a remote API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dualstore_common::{Collection, Entity, StoreGroup, DEFAULT_ID_ATTRIBUTE};
use dualstore_storage::{HttpRemote, LocalStore, RemoteRequest, RemoteTransport, SqliteStore};
use dualstore_sync::{DualStorage, DualStorageConfig, JournalKind, JournalStore};

const LOCAL_DB: &str = "local.db";
const JOURNAL_DB: &str = "journal.db";

#[derive(Parser)]
#[command(name = "dualstore")]
#[command(about = "DualStore - Offline-first sync journal management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory holding the local store and journal.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether changes are pending, per group.
    Status,

    /// List pending entries of a group.
    Pending {
        /// Store group.
        #[arg(short, long)]
        group: String,
    },

    /// Drop every pending entry of a group.
    Reset {
        /// Store group.
        #[arg(short, long)]
        group: String,
    },

    /// Drop every pending entry of every group.
    Clear,

    /// Repair drift between the local store and the journal.
    Repair {
        /// Store group.
        #[arg(short, long)]
        group: String,
    },

    /// Push pending changes of a group to the remote.
    Replay {
        /// Store group.
        #[arg(short, long)]
        group: String,

        /// Base URL of the remote API.
        #[arg(short, long)]
        remote: String,

        /// Name of the identifier attribute in remote payloads.
        #[arg(long, default_value = DEFAULT_ID_ATTRIBUTE)]
        id_attribute: String,
    },
}

/// Stand-in transport for commands that never reach the remote.
struct Detached;

#[async_trait]
impl RemoteTransport for Detached {
    fn name(&self) -> &str {
        "detached"
    }

    async fn send(&self, request: RemoteRequest) -> dualstore_common::Result<Value> {
        Err(dualstore_common::Error::remote(
            0,
            format!("no remote configured for {}", request.method),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG applies unless --verbose is given
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir(),
    };
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Status => cmd_status(&data_dir).await,
        Commands::Pending { group } => cmd_pending(&data_dir, &group).await,
        Commands::Reset { group } => cmd_reset(&data_dir, &group).await,
        Commands::Clear => cmd_clear(&data_dir).await,
        Commands::Repair { group } => cmd_repair(&data_dir, config, &group).await,
        Commands::Replay {
            group,
            remote,
            id_attribute,
        } => cmd_replay(&data_dir, config, &group, &remote, &id_attribute).await,
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dualstore")
}

fn load_config(path: Option<&Path>) -> Result<DualStorageConfig> {
    match path {
        Some(path) => DualStorageConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(DualStorageConfig::default()),
    }
}

fn open_journal(data_dir: &Path) -> Result<JournalStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    JournalStore::open(data_dir.join(JOURNAL_DB)).context("Failed to open journal")
}

fn open_storage(
    data_dir: &Path,
    config: DualStorageConfig,
    remote: Arc<dyn RemoteTransport>,
) -> Result<DualStorage<SqliteStore, dyn RemoteTransport>> {
    let journal = open_journal(data_dir)?;
    let local = SqliteStore::open(data_dir.join(LOCAL_DB)).context("Failed to open local store")?;
    Ok(DualStorage::from_arc(
        Arc::new(local),
        remote,
        Arc::new(journal),
        config,
    ))
}

fn parse_group(group: &str) -> Result<StoreGroup> {
    StoreGroup::new(group).context("Invalid store group")
}

/// Show pending state.
async fn cmd_status(data_dir: &Path) -> Result<()> {
    let journal = open_journal(data_dir)?;

    let pending = journal.has_dirty_or_destroyed().await?;
    println!("Data directory: {}", data_dir.display());
    println!("Pending changes: {}", if pending { "yes" } else { "no" });

    for group in journal.groups().await? {
        let dirty = journal.count(JournalKind::Dirty, Some(&group)).await?;
        let destroyed = journal.count(JournalKind::Destroyed, Some(&group)).await?;
        println!("  {}: {} dirty, {} destroyed", group, dirty, destroyed);
    }

    Ok(())
}

/// List pending entries of a group.
async fn cmd_pending(data_dir: &Path, group: &str) -> Result<()> {
    let group = parse_group(group)?;
    let journal = open_journal(data_dir)?;

    let dirty = journal.find_all_dirty(&group).await?;
    let destroyed = journal.find_all_destroyed(&group).await?;

    if dirty.is_empty() && destroyed.is_empty() {
        println!("Nothing pending in {}.", group);
        return Ok(());
    }

    println!("Pending in {}:", group);
    for (kind, entries) in [
        (JournalKind::Dirty, &dirty),
        (JournalKind::Destroyed, &destroyed),
    ] {
        for entry in entries {
            println!(
                "  [{}] {} (queued {}, entry {})",
                kind, entry.model_id, entry.queued_at, entry.id
            );
        }
    }

    Ok(())
}

/// Drop pending entries of a group.
async fn cmd_reset(data_dir: &Path, group: &str) -> Result<()> {
    let group = parse_group(group)?;
    let journal = open_journal(data_dir)?;

    let removed = journal.reset(&group).await.context("Failed to reset group")?;
    println!("Removed {} pending entries from {}", removed, group);

    Ok(())
}

/// Drop every pending entry.
async fn cmd_clear(data_dir: &Path) -> Result<()> {
    let journal = open_journal(data_dir)?;
    journal.clear().await.context("Failed to clear journal")?;
    println!("Journal cleared.");
    Ok(())
}

/// Repair journal drift of a group.
async fn cmd_repair(data_dir: &Path, config: DualStorageConfig, group: &str) -> Result<()> {
    let group = parse_group(group)?;
    let storage = open_storage(data_dir, config, Arc::new(Detached))?;

    let repaired = storage
        .reconcile(&group)
        .await
        .context("Failed to reconcile group")?;
    storage.close_all().await?;

    println!("Repaired {} entries in {}", repaired, group);
    Ok(())
}

/// Replay pending changes of a group.
async fn cmd_replay(
    data_dir: &Path,
    config: DualStorageConfig,
    group: &str,
    remote: &str,
    id_attribute: &str,
) -> Result<()> {
    let group = parse_group(group)?;
    let remote = HttpRemote::new(remote).context("Invalid remote URL")?;
    info!("Replaying {} against {}", group, remote.base());
    let storage = open_storage(data_dir, config, Arc::new(remote))?;

    let mut collection = Collection::new(group.clone()).with_id_attribute(id_attribute);
    for record in storage.local().list_live(&group).await? {
        collection.upsert(Entity::from_record(record, id_attribute));
    }

    let result = storage.sync_dirty_and_destroyed(&mut collection).await;
    storage.close_all().await?;
    let report = result.context("Replay failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
