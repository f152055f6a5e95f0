// ABOUTME: CLI entry point for article-sync
// ABOUTME: Parses commands and routes to sync, watermark, and inspection handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use article_sync::config::SyncConfig;
use article_sync::lock::SyncLock;
use article_sync::sqlite::SqliteEntityStore;
use article_sync::sync::daemon::{DaemonConfig, SyncDaemon};
use article_sync::sync::repository::EntityRepository;
use article_sync::sync::watermark::{FileWatermarkStore, WatermarkStore};
use article_sync::sync::RunOutcome;
use article_sync::utils::parse_timestamp;

#[derive(Parser)]
#[command(name = "article-sync")]
#[command(about = "Mirror changed external articles into a local content store", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a TOML configuration file
    #[arg(long, env = "ARTICLE_SYNC_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// External SQLite database (overrides [source] path)
    #[arg(long, env = "ARTICLE_SYNC_SOURCE", global = true)]
    source: Option<PathBuf>,
    /// Local content store (overrides [store] path)
    #[arg(long, env = "ARTICLE_SYNC_STORE", global = true)]
    store: Option<PathBuf>,
    /// Watermark state file (overrides [sync] state_path)
    #[arg(long = "state-file", env = "ARTICLE_SYNC_STATE", global = true)]
    state_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync changed articles, continuously unless --once is given
    Sync {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes (overrides [sync] interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Inspect or move the sync watermark
    Watermark {
        #[command(subcommand)]
        action: WatermarkCommand,
    },
    /// List mirrored entities
    Entities {
        /// Maximum number of entities to print
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show watermark, pending retries, and lock holder
    Status,
}

#[derive(Subcommand)]
enum WatermarkCommand {
    /// Print the stored watermark
    Get,
    /// Store a new watermark (RFC 3339 or unix seconds)
    Set { value: String },
    /// Forget the watermark and retry set; the next pass syncs everything
    Reset,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        if let Some(source) = &self.source {
            config.source.path = source.clone();
        }
        if let Some(store) = &self.store {
            config.store.path = store.clone();
        }
        if let Some(state_file) = &self.state_file {
            config.sync.state_path = state_file.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    // Logs go to stderr so command output stays scriptable
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = cli.load_config()?;

    match cli.command {
        Commands::Sync { once, interval } => {
            if let Some(interval) = interval {
                config.sync.interval_secs = interval;
            }
            config.validate()?;
            sync(&config, once).await
        }
        Commands::Watermark { action } => {
            config.validate()?;
            watermark(&config, action)
        }
        Commands::Entities { limit } => entities(&config, limit),
        Commands::Status => {
            config.validate()?;
            status(&config)
        }
    }
}

async fn sync(config: &SyncConfig, once: bool) -> anyhow::Result<()> {
    let daemon = SyncDaemon::new(DaemonConfig::from_config(config)?);

    if once {
        tracing::info!("Running single sync pass...");
        let Some(report) = daemon.run_sync_cycle().await? else {
            println!("Sync skipped (see log for details)");
            return Ok(());
        };

        println!();
        println!("========================================");
        println!("Article sync complete");
        println!("========================================");
        println!("  Run: {}", report.run_id);
        println!("  Outcome: {:?}", report.outcome);
        println!("  Created: {}", report.summary.created);
        println!("  Updated: {}", report.summary.updated);
        if !report.failed_ids.is_empty() {
            println!("  Failed: {}", report.failed_ids.join(", "));
        }
        match report.new_watermark {
            Some(watermark) => println!("  Watermark: {}", watermark.to_rfc3339()),
            None => println!(
                "  Watermark: {} (unchanged)",
                report.previous_watermark.to_rfc3339()
            ),
        }

        if report.outcome == RunOutcome::SourceUnavailable {
            anyhow::bail!("External source was unavailable");
        }
        return Ok(());
    }

    tracing::info!("Starting continuous sync daemon...");
    tracing::info!("Press Ctrl+C to stop");

    println!();
    println!("========================================");
    println!("Starting continuous article sync");
    println!("========================================");
    println!("  Sync interval: {}s", config.sync.interval_secs);
    println!("  Press Ctrl+C to stop");
    println!();

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = shutdown_tx_clone.send(());
    });

    daemon.run(shutdown_rx).await
}

fn watermark(config: &SyncConfig, action: WatermarkCommand) -> anyhow::Result<()> {
    let store = FileWatermarkStore::new(&config.sync.state_path);
    let key = config.sync.watermark_key.as_str();

    match action {
        WatermarkCommand::Get => match store.read(key)? {
            Some(value) => println!("{}", value.to_rfc3339()),
            None => println!("{} (initial)", config.initial_watermark()?.to_rfc3339()),
        },
        WatermarkCommand::Set { value } => {
            let value = parse_timestamp(&value)?;
            store.set(key, value)?;
            tracing::info!("Watermark {} set to {}", key, value);
            println!("{}", value.to_rfc3339());
        }
        WatermarkCommand::Reset => {
            if store.remove(key)? {
                println!("Watermark {} reset", key);
            } else {
                println!("Watermark {} was not set", key);
            }
        }
    }
    Ok(())
}

fn entities(config: &SyncConfig, limit: Option<usize>) -> anyhow::Result<()> {
    let path = &config.store.path;
    if !path.exists() {
        println!("No content store at {}", path.display());
        return Ok(());
    }

    let store = SqliteEntityStore::open(path)
        .with_context(|| format!("Failed to open content store {}", path.display()))?;
    let entities = store.list(&config.store.entity_type, limit)?;

    for entity in &entities {
        let preview: String = entity.body.chars().take(60).collect();
        println!(
            "{}\t{}\trev {}\t{}\t{}",
            entity.id,
            entity.external_id,
            entity.revision,
            entity.updated_at.to_rfc3339(),
            preview.replace('\n', " ")
        );
    }
    println!(
        "{} {} entities",
        store.count(&config.store.entity_type)?,
        config.store.entity_type
    );
    Ok(())
}

fn status(config: &SyncConfig) -> anyhow::Result<()> {
    let watermarks = FileWatermarkStore::new(&config.sync.state_path);
    let key = config.sync.watermark_key.as_str();

    println!("Job: {}", key);
    println!("  Source: {} ({})", config.source.path.display(), config.source.table);
    println!("  Store: {}", config.store.path.display());

    match watermarks.checkpoint(key)? {
        Some(checkpoint) => {
            match checkpoint.value {
                Some(value) => println!("  Watermark: {}", value.to_rfc3339()),
                None => println!("  Watermark: not set"),
            }
            if let Some(updated_at) = checkpoint.updated_at {
                println!("  Last written: {}", updated_at.to_rfc3339());
            }
            println!("  Pending retries: {}", checkpoint.failed_ids.len());
            for id in &checkpoint.failed_ids {
                println!("    - {}", id);
            }
        }
        None => println!(
            "  Watermark: not set (next pass starts from {})",
            config.initial_watermark()?.to_rfc3339()
        ),
    }

    match SyncLock::holder(&config.sync.lock_path) {
        Ok(Some(info)) => println!(
            "  Lock: held by PID {} ({}) since {}",
            info.pid,
            info.job,
            info.acquired_at.to_rfc3339()
        ),
        Ok(None) => println!("  Lock: free"),
        Err(e) => println!("  Lock: unreadable ({:#})", e),
    }

    Ok(())
}
