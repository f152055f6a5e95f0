// ABOUTME: Incremental article sync from an external table into the local store
// ABOUTME: Watermark-driven passes with per-record fault isolation and a retry set

pub mod clock;
pub mod daemon;
pub mod error;
pub mod reconciler;
pub mod repository;
pub mod source;
pub mod watermark;

pub use clock::{Clock, SystemClock, Timestamp};
pub use daemon::{DaemonConfig, SyncDaemon};
pub use error::{RecordError, SourceError, UpsertAction, UpsertError};
pub use reconciler::{ReconcileConfig, Reconciler, RunOutcome, SyncReport, SyncSummary, UpsertOutcome};
pub use repository::{EntityId, EntityRepository, LocalEntity, NewEntity};
pub use source::{ColumnMapping, ExternalRecord, ExternalSource, FetchOutcome, SourceReader};
pub use watermark::{FileWatermarkStore, WatermarkStore};
