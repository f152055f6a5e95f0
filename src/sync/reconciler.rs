// ABOUTME: Reconciler for article sync - runs one incremental pass from source to local store
// ABOUTME: Matches records by external id, creates or updates entities, then advances the watermark

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::clock::{Clock, Timestamp};
use super::error::{RecordError, UpsertAction, UpsertError};
use super::repository::{EntityRepository, LocalEntity, NewEntity, EXTERNAL_ID_FIELD};
use super::source::{
    row_external_id, row_external_ids, ColumnMapping, ExternalRecord, ExternalSource,
    FetchOutcome, Row, SourceReader,
};
use super::watermark::{sentinel_epoch, WatermarkStore, DEFAULT_WATERMARK_KEY};

/// Configuration for one sync job.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Source table holding the articles
    pub table: String,
    /// Entity type the articles are mirrored into
    pub entity_type: String,
    /// Key of this job's checkpoint in the watermark store
    pub watermark_key: String,
    /// Watermark used before the first completed run
    pub initial_watermark: Timestamp,
    pub columns: ColumnMapping,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            table: "articles".to_string(),
            entity_type: "article".to_string(),
            watermark_key: DEFAULT_WATERMARK_KEY.to_string(),
            initial_watermark: sentinel_epoch(),
            columns: ColumnMapping::default(),
        }
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: u64,
    pub updated: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All records were visited and the watermark was written
    Completed,
    /// The source had nothing newer than the watermark
    NoRows,
    /// The source could not be read; nothing was processed
    SourceUnavailable,
    /// Stopped between records; watermark untouched
    Cancelled,
    /// All records were visited but another writer had moved the checkpoint
    WatermarkConflict,
}

/// Result of [`Reconciler::run_sync`].
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub summary: SyncSummary,
    /// External ids that failed in this run, in processing order
    pub failed_ids: Vec<String>,
    pub previous_watermark: Timestamp,
    /// Watermark written by this run, if any
    pub new_watermark: Option<Timestamp>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn watermark_advanced(&self) -> bool {
        self.new_watermark
            .is_some_and(|watermark| watermark > self.previous_watermark)
    }
}

/// Result of mirroring a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(LocalEntity),
    Updated(LocalEntity),
}

impl UpsertOutcome {
    pub fn entity(&self) -> &LocalEntity {
        match self {
            UpsertOutcome::Created(entity) | UpsertOutcome::Updated(entity) => entity,
        }
    }
}

/// Runs synchronization passes from an external source into a local repository.
///
/// Collaborators are injected; the reconciler owns no global state. One pass
/// is strictly sequential and never aborts on a bad record: per-record
/// failures are logged, remembered in the retry set, and skipped. The
/// watermark is only written once every record has been visited.
pub struct Reconciler<S, R, W, C> {
    reader: SourceReader<S>,
    repository: R,
    watermarks: W,
    clock: C,
    config: ReconcileConfig,
    cancel: Arc<AtomicBool>,
}

impl<S, R, W, C> Reconciler<S, R, W, C>
where
    S: ExternalSource,
    R: EntityRepository,
    W: WatermarkStore,
    C: Clock,
{
    pub fn new(source: S, repository: R, watermarks: W, clock: C, config: ReconcileConfig) -> Self {
        Self {
            reader: SourceReader::new(source, config.columns.clone()),
            repository,
            watermarks,
            clock,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag; when set the run stops before the next record.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Execute one synchronization pass.
    ///
    /// Only watermark store failures are returned as errors. Source failures
    /// end the run as [`RunOutcome::SourceUnavailable`], record failures are
    /// counted in neither tally.
    pub fn run_sync(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let run_id = Uuid::new_v4();
        let key = self.config.watermark_key.as_str();
        let table = self.config.table.as_str();

        let stored = self.watermarks.read(key)?;
        let previous = stored.unwrap_or(self.config.initial_watermark);
        let start_time = self.clock.now();
        let retry_ids = self.watermarks.retry_set(key)?;

        tracing::info!(
            "Starting article sync {} for {} (watermark {}, {} pending retries)",
            run_id,
            table,
            previous,
            retry_ids.len()
        );

        let mut report = SyncReport {
            run_id,
            outcome: RunOutcome::NoRows,
            summary: SyncSummary::default(),
            failed_ids: Vec::new(),
            previous_watermark: previous,
            new_watermark: None,
            duration_ms: 0,
        };

        let changed = match self.reader.fetch_changed(table, previous) {
            FetchOutcome::Rows(rows) => rows,
            FetchOutcome::Empty => {
                tracing::warn!("The query for {} did not return a result.", table);
                Vec::new()
            }
            FetchOutcome::Unavailable(e) => {
                tracing::error!("Unable to read {} from the external source: {}", table, e);
                report.outcome = RunOutcome::SourceUnavailable;
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }
        };

        let (retry_rows, carried) = self.fetch_retry_rows(&retry_ids, &changed);

        if changed.is_empty() && retry_rows.is_empty() {
            // Forget retry ids the source no longer has; unreachable ones stay queued
            let remaining: BTreeSet<String> = carried.into_iter().collect();
            if remaining != retry_ids {
                tracing::info!(
                    "Dropping {} retry ids no longer present in {}",
                    retry_ids.len() - remaining.len(),
                    table
                );
                self.watermarks.set_retry_set(key, &remaining)?;
            }
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let mut failed: Vec<String> = Vec::new();
        for row in changed.into_iter().chain(retry_rows) {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!(
                    "Article sync {} cancelled after {} created and {} updated; watermark left at {}",
                    run_id,
                    report.summary.created,
                    report.summary.updated,
                    previous
                );
                report.outcome = RunOutcome::Cancelled;
                report.failed_ids = failed;
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }

            match self.process_row(row) {
                Ok(UpsertOutcome::Created(_)) => report.summary.created += 1,
                Ok(UpsertOutcome::Updated(_)) => report.summary.updated += 1,
                Err(Some(external_id)) => {
                    if !failed.contains(&external_id) {
                        failed.push(external_id);
                    }
                }
                Err(None) => {}
            }
        }

        let new_watermark = if start_time > previous {
            start_time
        } else {
            tracing::warn!(
                "Run start time {} is not after watermark {}; keeping the watermark",
                start_time,
                previous
            );
            previous
        };

        let mut retry: BTreeSet<String> = failed.iter().cloned().collect();
        retry.extend(carried);

        if self.watermarks.compare_and_set(key, stored, new_watermark)? {
            self.watermarks.set_retry_set(key, &retry)?;
            report.outcome = RunOutcome::Completed;
            report.new_watermark = Some(new_watermark);
        } else {
            tracing::warn!(
                "Checkpoint {} was moved by another run since {}; leaving it in place",
                key,
                previous
            );
            // Keep our failures queued alongside the other run's
            let mut merged = self.watermarks.retry_set(key)?;
            merged.extend(retry);
            self.watermarks.set_retry_set(key, &merged)?;
            report.outcome = RunOutcome::WatermarkConflict;
        }

        tracing::info!(
            "Added {} articles and updated {} articles.",
            report.summary.created,
            report.summary.updated
        );
        if !failed.is_empty() {
            tracing::warn!(
                "{} articles failed and will be retried on the next run",
                failed.len()
            );
        }

        report.failed_ids = failed;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Fetch rows for retry ids not already in the changed window.
    ///
    /// Returns the rows plus ids that must stay queued because the source
    /// could not be asked for them.
    fn fetch_retry_rows(
        &self,
        retry_ids: &BTreeSet<String>,
        changed: &[Row],
    ) -> (Vec<Row>, Vec<String>) {
        if retry_ids.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let in_window = row_external_ids(changed, &self.config.columns);
        let pending: Vec<String> = retry_ids
            .iter()
            .filter(|id| !in_window.contains(*id))
            .cloned()
            .collect();

        match self.reader.fetch_by_ids(&self.config.table, &pending) {
            FetchOutcome::Rows(rows) => {
                tracing::info!("Retrying {} previously failed articles", rows.len());
                (rows, Vec::new())
            }
            FetchOutcome::Empty => {
                if !pending.is_empty() {
                    tracing::info!(
                        "{} previously failed articles no longer exist in the source",
                        pending.len()
                    );
                }
                (Vec::new(), Vec::new())
            }
            FetchOutcome::Unavailable(e) => {
                tracing::error!(
                    "Unable to fetch {} previously failed articles: {}",
                    pending.len(),
                    e
                );
                (Vec::new(), pending)
            }
        }
    }

    /// Decode and upsert one row. On failure returns the row's external id, if known.
    fn process_row(&self, row: Row) -> std::result::Result<UpsertOutcome, Option<String>> {
        let attributed = row_external_id(&row, &self.config.columns);
        let record = match ExternalRecord::from_row(row, &self.config.columns) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    "Skipping malformed row from {} (article {}): {}",
                    self.config.table,
                    attributed.as_deref().unwrap_or("<unknown>"),
                    e
                );
                return Err(attributed);
            }
        };

        self.upsert(&record).map_err(|failure| {
            match failure.action {
                UpsertAction::Create => tracing::error!(
                    "There was a problem adding a new article for {}: {}",
                    failure.external_id,
                    failure.error
                ),
                UpsertAction::Update | UpsertAction::Lookup => tracing::error!(
                    "There was a problem updating an article for {}: {}",
                    failure.external_id,
                    failure.error
                ),
            }
            Some(failure.external_id)
        })
    }

    /// Create or update the local entity for `record`.
    pub fn upsert(&self, record: &ExternalRecord) -> std::result::Result<UpsertOutcome, UpsertError> {
        let external_id = record.external_id.as_str();
        let entity_type = self.config.entity_type.as_str();

        let mut matches = self
            .repository
            .find_by_field(entity_type, EXTERNAL_ID_FIELD, external_id)
            .map_err(|e| {
                UpsertError::new(
                    external_id,
                    UpsertAction::Lookup,
                    RecordError::Lookup(format!("{:#}", e)),
                )
            })?;
        matches.sort();

        let Some(&first) = matches.first() else {
            let entity = self
                .repository
                .create(NewEntity::article(entity_type, external_id))
                .map_err(|e| {
                    UpsertError::new(
                        external_id,
                        UpsertAction::Create,
                        RecordError::Create(format!("{:#}", e)),
                    )
                })?;
            tracing::debug!("Created {} {} for article {}", entity_type, entity.id, external_id);

            return self
                .apply_content(entity, record)
                .map(UpsertOutcome::Created)
                .map_err(|e| UpsertError::new(external_id, UpsertAction::Create, e));
        };

        if matches.len() > 1 {
            tracing::error!(
                "Data integrity error: {} {} entities share external id {} ({:?}); using {}",
                matches.len(),
                entity_type,
                external_id,
                matches,
                first
            );
        }

        let update_err = |e: RecordError| UpsertError::new(external_id, UpsertAction::Update, e);
        let entity = self
            .repository
            .load(first)
            .map_err(|e| {
                update_err(RecordError::Load {
                    id: first,
                    message: format!("{:#}", e),
                })
            })?
            .ok_or_else(|| {
                update_err(RecordError::Load {
                    id: first,
                    message: "entity not found".to_string(),
                })
            })?;

        self.apply_content(entity, record)
            .map(UpsertOutcome::Updated)
            .map_err(update_err)
    }

    /// Mirror the record's content into `entity` and save it.
    ///
    /// The save happens even when the body is unchanged.
    fn apply_content(
        &self,
        mut entity: LocalEntity,
        record: &ExternalRecord,
    ) -> std::result::Result<LocalEntity, RecordError> {
        if entity.body != record.content {
            entity.body = record.content.clone();
        } else {
            tracing::debug!("Body of {} unchanged; saving anyway", entity.id);
        }

        let id = entity.id;
        match self.repository.save(&mut entity) {
            Ok(true) => {}
            Ok(false) => return Err(RecordError::SaveRejected(id)),
            Err(e) => {
                return Err(RecordError::Save {
                    id,
                    message: format!("{:#}", e),
                })
            }
        }

        match self.repository.load(id) {
            Ok(Some(saved)) => Ok(saved),
            Ok(None) => Err(RecordError::SaveVerification(id)),
            Err(e) => Err(RecordError::Load {
                id,
                message: format!("{:#}", e),
            }),
        }
    }
}
