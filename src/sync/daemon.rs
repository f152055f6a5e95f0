// ABOUTME: SyncDaemon for article sync - runs reconciler passes on an interval
// ABOUTME: Serializes passes with a lock file and cancels the in-flight pass on shutdown

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use super::clock::SystemClock;
use super::reconciler::{ReconcileConfig, Reconciler, RunOutcome, SyncReport};
use super::watermark::FileWatermarkStore;
use crate::config::SyncConfig;
use crate::lock::SyncLock;
use crate::sqlite::{SqliteEntityStore, SqliteSource};

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync cycles
    pub sync_interval: Duration,
    /// External SQLite database
    pub source_path: PathBuf,
    /// Local content store
    pub store_path: PathBuf,
    /// Watermark state file
    pub state_path: PathBuf,
    /// Lock file guarding against overlapping passes
    pub lock_path: PathBuf,
    pub reconcile: ReconcileConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            sync_interval: defaults.interval(),
            source_path: defaults.source.path,
            store_path: defaults.store.path,
            state_path: defaults.sync.state_path,
            lock_path: defaults.sync.lock_path,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            sync_interval: config.interval(),
            source_path: config.source.path.clone(),
            store_path: config.store.path.clone(),
            state_path: config.sync.state_path.clone(),
            lock_path: config.sync.lock_path.clone(),
            reconcile: config.reconcile_config()?,
        })
    }
}

/// Run one pass synchronously.
///
/// Returns `Ok(None)` when the pass was skipped: another pass holds the lock,
/// or the external database could not be opened.
pub fn run_once(config: &DaemonConfig, cancel: Arc<AtomicBool>) -> Result<Option<SyncReport>> {
    let job = config.reconcile.watermark_key.as_str();
    let Some(_lock) = SyncLock::acquire(&config.lock_path, job)? else {
        tracing::warn!(
            "Another sync of {} is already running (lock {:?}); skipping this cycle",
            job,
            config.lock_path
        );
        return Ok(None);
    };

    let source = match SqliteSource::open(&config.source_path) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("Unable to open the external source: {:#}", e);
            return Ok(None);
        }
    };
    let store = SqliteEntityStore::open(&config.store_path)?;
    let watermarks = FileWatermarkStore::new(&config.state_path);

    let reconciler = Reconciler::new(
        source,
        store,
        watermarks,
        SystemClock,
        config.reconcile.clone(),
    )
    .with_cancellation(cancel);

    reconciler.run_sync().map(Some)
}

/// SyncDaemon runs article sync passes until stopped.
pub struct SyncDaemon {
    config: DaemonConfig,
    cancel: Arc<AtomicBool>,
}

impl SyncDaemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Flag that stops the current pass before its next record.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run a single sync cycle on the blocking pool.
    pub async fn run_sync_cycle(&self) -> Result<Option<SyncReport>> {
        let config = self.config.clone();
        let cancel = self.cancellation();
        tokio::task::spawn_blocking(move || run_once(&config, cancel))
            .await
            .context("Sync cycle task panicked")?
    }

    /// Run the daemon continuously until stopped.
    ///
    /// A shutdown received mid-cycle cancels the pass and waits for it to
    /// stop, so the watermark is never written for a partial pass.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut sync_interval = interval(self.config.sync_interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting SyncDaemon for {} with sync_interval={:?}",
            self.config.reconcile.table,
            self.config.sync_interval
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = sync_interval.tick() => {
                    cycles += 1;
                    tracing::info!("Starting sync cycle {}", cycles);

                    let cycle = self.run_sync_cycle();
                    tokio::pin!(cycle);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync cycle, cancelling");
                            self.cancel.store(true, Ordering::SeqCst);
                            log_cycle(cycles, cycle.await);
                            break;
                        }
                        result = &mut cycle => log_cycle(cycles, result),
                    }
                }
            }
        }

        Ok(())
    }
}

fn log_cycle(cycle: u64, result: Result<Option<SyncReport>>) {
    match result {
        Ok(Some(report)) => match report.outcome {
            RunOutcome::Completed | RunOutcome::NoRows => tracing::info!(
                "Sync cycle {} completed: {} created, {} updated, {} failed in {}ms",
                cycle,
                report.summary.created,
                report.summary.updated,
                report.failed_ids.len(),
                report.duration_ms
            ),
            outcome => tracing::warn!(
                "Sync cycle {} ended early ({:?}) after {}ms",
                cycle,
                outcome,
                report.duration_ms
            ),
        },
        Ok(None) => tracing::info!("Sync cycle {} skipped", cycle),
        // Log with :# to show the full error chain
        Err(e) => tracing::error!("Sync cycle {} failed: {:#}", cycle, e),
    }
}
