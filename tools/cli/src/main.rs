//! RecordSync CLI - Command line interface for record synchronization.
//!
//! This tool drives the sync engine against a configured server and a local
//! journal store: one-shot pulls and pushes, a status view of pending
//! changes, and a periodic watch mode.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use recordsync_common::RecordRef;
use recordsync_sync::{
    JournalStore, LocalStore, SyncConfig, SyncEngine, SyncMode, SyncScheduler, SyncStatus,
};
use recordsync_transport::{create_default_registry, RemoteTransport};

type Engine = SyncEngine<dyn RemoteTransport, JournalStore>;

#[derive(Parser)]
#[command(name = "recordsync")]
#[command(about = "RecordSync - Offline record store synchronization")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "sync.json")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download records from the server.
    Pull,

    /// Upload pending local changes.
    Push,

    /// Push, then pull.
    Sync,

    /// Show pending changes and record states.
    Status,

    /// Sync periodically until interrupted.
    Watch {
        /// Seconds between syncs.
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },
}

/// Contents of the configuration file.
#[derive(Debug, Deserialize)]
struct CliConfig {
    /// Registered transport name.
    #[serde(default = "default_transport")]
    transport: String,
    /// Settings handed to the transport factory.
    #[serde(default)]
    transport_config: Value,
    /// Directory holding the local store.
    store_dir: PathBuf,
    /// Engine settings.
    #[serde(default)]
    sync: SyncConfig,
}

fn default_transport() -> String {
    "http".to_string()
}

impl CliConfig {
    async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = CliConfig::load(&cli.config).await?;
    let engine = build_engine(config).await?;

    match cli.command {
        Commands::Pull => cmd_pull(&engine).await,
        Commands::Push => cmd_push(&engine).await,
        Commands::Sync => cmd_sync(&engine).await,
        Commands::Status => cmd_status(&engine).await,
        Commands::Watch { interval } => cmd_watch(Arc::new(engine), interval).await,
    }
}

/// Resolve the transport, open the store and assemble the engine.
async fn build_engine(config: CliConfig) -> Result<Engine> {
    let registry = create_default_registry();
    let transport = registry
        .resolve(&config.transport, config.transport_config)
        .with_context(|| format!("Failed to set up transport '{}'", config.transport))?;

    let store = JournalStore::open(&config.store_dir)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store_dir.display()))?;

    info!(
        "Using {} transport, store at {}",
        transport.name(),
        config.store_dir.display()
    );
    Ok(SyncEngine::new(transport, Arc::new(store), config.sync))
}

/// Run the pull side once.
async fn cmd_pull(engine: &Engine) -> Result<()> {
    let summary = engine.pull().await.context("Pull failed")?;

    println!("Pull complete: {}", summary);
    for (record_type, count) in &summary.per_type {
        println!(
            "  {:<20} {:>6} unique {:>6} received",
            record_type.as_str(),
            count.unique,
            count.total
        );
    }
    if summary.malformed_references > 0 {
        println!("  {} malformed reference(s) skipped", summary.malformed_references);
    }

    Ok(())
}

/// Upload pending changes once.
async fn cmd_push(engine: &Engine) -> Result<()> {
    let report = engine.push().await.context("Push failed")?;

    println!(
        "Push complete: {} envelope(s), {} change(s) cleared",
        report.envelopes_uploaded,
        report.consolidation.tokens_removed.len()
    );
    for (old, new) in &report.consolidation.ids_rewritten {
        println!("  {} -> {}", old, new);
    }
    for failure in &report.consolidation.failures {
        println!(
            "  refused {}: {}{}",
            failure.record,
            failure.diagnostics,
            if failure.retained { " (kept)" } else { "" }
        );
    }
    if report.patches_skipped > 0 {
        println!("  {} patch(es) already in flight", report.patches_skipped);
    }

    Ok(())
}

/// Push, then pull.
async fn cmd_sync(engine: &Engine) -> Result<()> {
    let report = engine.sync_full().await.context("Sync failed")?;
    println!("Sync complete: {}", report);
    Ok(())
}

/// Show pending changes and record states.
async fn cmd_status(engine: &Engine) -> Result<()> {
    let store = engine.store();
    let records = store.records().await;
    let pending = store
        .list_pending_changes(None)
        .await
        .context("Failed to read change journal")?;

    let mut by_status: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &records {
        let label = match entry.status {
            SyncStatus::Synced => "synced",
            SyncStatus::LocalModified => "modified",
            SyncStatus::Stale => "stale",
        };
        *by_status.entry(label).or_default() += 1;
    }

    println!("Records: {}", records.len());
    for (label, count) in &by_status {
        println!("  {:<10} {}", label, count);
    }

    let mut by_record: BTreeMap<String, (RecordRef, Vec<String>)> = BTreeMap::new();
    for change in &pending {
        by_record
            .entry(change.record.to_string())
            .or_insert_with(|| (change.record.clone(), Vec::new()))
            .1
            .push(format!("{:?}", change.kind));
    }

    println!("Pending changes: {}", pending.len());
    for (record, kinds) in by_record.values() {
        println!("  {:<40} {}", record.to_string(), kinds.join(", "));
    }

    let stale = store.stale_records().await;
    if !stale.is_empty() {
        println!("Stale records: {}", stale.len());
        for record in &stale {
            println!("  {}", record);
        }
    }

    Ok(())
}

/// Sync on a timer until Ctrl-C.
async fn cmd_watch(engine: Arc<Engine>, interval: u64) -> Result<()> {
    if interval == 0 {
        anyhow::bail!("Interval must be at least one second");
    }

    let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
        interval: Duration::from_secs(interval),
    });

    let worker = engine.clone();
    let task = tokio::spawn(handle.run(move |request| {
        let engine = worker.clone();
        async move { engine.process_request(request).await }
    }));

    println!("Watching every {}s, press Ctrl-C to stop", interval);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping");
    engine.cancel();
    scheduler.shutdown().await;
    task.await.context("Scheduler task failed")?;

    Ok(())
}
