// ABOUTME: Watermark store for incremental sync - persists the last-check timestamp per job
// ABOUTME: Also keeps the retry set of external ids that failed in the last completed run

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::clock::Timestamp;
use crate::utils::from_unix_seconds;

/// Key under which the article job stores its checkpoint.
pub const DEFAULT_WATERMARK_KEY: &str = "article_sync.last_check";

/// Unix seconds of the "sync everything" sentinel (2010-11-23T19:36:18Z).
pub const SENTINEL_EPOCH_SECS: i64 = 1_290_540_978;

/// The sentinel watermark used when no checkpoint has been stored yet.
pub fn sentinel_epoch() -> Timestamp {
    // The constant is well inside chrono's range.
    from_unix_seconds(SENTINEL_EPOCH_SECS).unwrap_or_default()
}

/// Persistent storage for sync checkpoints.
///
/// Every method takes `&self`: implementations re-read their backing storage
/// so that a checkpoint moved by another process is observed by
/// [`WatermarkStore::compare_and_set`].
pub trait WatermarkStore {
    /// Stored watermark for `key`, if any.
    fn read(&self, key: &str) -> Result<Option<Timestamp>>;

    /// Unconditionally store `value` for `key`.
    fn set(&self, key: &str, value: Timestamp) -> Result<()>;

    /// Store `value` only if the current watermark equals `expected`.
    ///
    /// `expected == None` means "no watermark stored yet". Returns whether the
    /// write happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Timestamp>,
        value: Timestamp,
    ) -> Result<bool>;

    /// External ids that failed during the last completed run.
    fn retry_set(&self, key: &str) -> Result<BTreeSet<String>>;

    /// Replace the retry set for `key`.
    fn set_retry_set(&self, key: &str, ids: &BTreeSet<String>) -> Result<()>;

    /// Forget the checkpoint for `key` entirely. Returns whether one existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Stored watermark, or `default` when none has been written.
    fn get(&self, key: &str, default: Timestamp) -> Result<Timestamp> {
        Ok(self.read(key)?.unwrap_or(default))
    }
}

impl<W: WatermarkStore + ?Sized> WatermarkStore for &W {
    fn read(&self, key: &str) -> Result<Option<Timestamp>> {
        (**self).read(key)
    }

    fn set(&self, key: &str, value: Timestamp) -> Result<()> {
        (**self).set(key, value)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Timestamp>,
        value: Timestamp,
    ) -> Result<bool> {
        (**self).compare_and_set(key, expected, value)
    }

    fn retry_set(&self, key: &str) -> Result<BTreeSet<String>> {
        (**self).retry_set(key)
    }

    fn set_retry_set(&self, key: &str, ids: &BTreeSet<String>) -> Result<()> {
        (**self).set_retry_set(key, ids)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        (**self).remove(key)
    }
}

/// Checkpoint for a single sync job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Start time of the last completed run
    pub value: Option<Timestamp>,
    /// When this checkpoint was last written
    pub updated_at: Option<Timestamp>,
    /// External ids to reprocess on the next run regardless of the watermark
    #[serde(default)]
    pub failed_ids: BTreeSet<String>,
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Version of the state format for future migrations
    pub version: u32,
    /// Checkpoints keyed by job key
    pub checkpoints: BTreeMap<String, Checkpoint>,
    /// When this file was created
    pub created_at: Timestamp,
    /// When this file was last modified
    pub updated_at: Timestamp,
}

impl CheckpointFile {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            version: 1,
            checkpoints: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Watermark store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default state file path for the current directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from(".article-sync/state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a checkpoint without interpreting it.
    pub fn checkpoint(&self, key: &str) -> Result<Option<Checkpoint>> {
        Ok(self.load()?.checkpoints.get(key).cloned())
    }

    fn load(&self) -> Result<CheckpointFile> {
        if !self.path.exists() {
            return Ok(CheckpointFile::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read sync state from {:?}", self.path))?;
        let state: CheckpointFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync state from {:?}", self.path))?;
        Ok(state)
    }

    fn store(&self, mut state: CheckpointFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        state.updated_at = chrono::Utc::now();
        let contents =
            serde_json::to_string_pretty(&state).context("Failed to serialize sync state")?;

        // Write-then-rename so a crash never leaves a truncated state file
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, contents)
            .with_context(|| format!("Failed to write sync state to {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace sync state at {:?}", self.path))?;
        Ok(())
    }

    fn update<F>(&self, key: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Checkpoint),
    {
        let mut state = self.load()?;
        let checkpoint = state.checkpoints.entry(key.to_string()).or_default();
        apply(checkpoint);
        self.store(state)
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn read(&self, key: &str) -> Result<Option<Timestamp>> {
        Ok(self
            .load()?
            .checkpoints
            .get(key)
            .and_then(|checkpoint| checkpoint.value))
    }

    fn set(&self, key: &str, value: Timestamp) -> Result<()> {
        self.update(key, |checkpoint| {
            checkpoint.value = Some(value);
            checkpoint.updated_at = Some(chrono::Utc::now());
        })
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Timestamp>,
        value: Timestamp,
    ) -> Result<bool> {
        let mut state = self.load()?;
        let current = state.checkpoints.get(key).and_then(|c| c.value);
        if current != expected {
            tracing::debug!(
                "Checkpoint '{}' moved from {:?} to {:?}; refusing to overwrite",
                key,
                expected,
                current
            );
            return Ok(false);
        }

        let checkpoint = state.checkpoints.entry(key.to_string()).or_default();
        checkpoint.value = Some(value);
        checkpoint.updated_at = Some(chrono::Utc::now());
        self.store(state)?;
        Ok(true)
    }

    fn retry_set(&self, key: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .load()?
            .checkpoints
            .get(key)
            .map(|checkpoint| checkpoint.failed_ids.clone())
            .unwrap_or_default())
    }

    fn set_retry_set(&self, key: &str, ids: &BTreeSet<String>) -> Result<()> {
        self.update(key, |checkpoint| {
            checkpoint.failed_ids = ids.clone();
        })
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.load()?;
        let removed = state.checkpoints.remove(key).is_some();
        if removed {
            self.store(state)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> Timestamp {
        chrono::Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_sentinel_epoch() {
        assert_eq!(sentinel_epoch().timestamp(), SENTINEL_EPOCH_SECS);
    }

    #[test]
    fn test_get_defaults_when_missing() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state.json"));

        assert_eq!(store.read(DEFAULT_WATERMARK_KEY).unwrap(), None);
        assert_eq!(
            store.get(DEFAULT_WATERMARK_KEY, sentinel_epoch()).unwrap(),
            sentinel_epoch()
        );
        // Reading must not create the file
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        FileWatermarkStore::new(&path)
            .set("job", ts(1_700_000_000))
            .unwrap();

        let reopened = FileWatermarkStore::new(&path);
        assert_eq!(reopened.read("job").unwrap(), Some(ts(1_700_000_000)));
        assert_eq!(reopened.read("other").unwrap(), None);
    }

    #[test]
    fn test_compare_and_set() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state.json"));

        // First write expects an absent checkpoint
        assert!(store.compare_and_set("job", None, ts(100)).unwrap());
        // Stale expectation is rejected
        assert!(!store.compare_and_set("job", None, ts(200)).unwrap());
        assert_eq!(store.read("job").unwrap(), Some(ts(100)));
        // Current expectation succeeds
        assert!(store.compare_and_set("job", Some(ts(100)), ts(300)).unwrap());
        assert_eq!(store.read("job").unwrap(), Some(ts(300)));
    }

    #[test]
    fn test_retry_set_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state.json"));
        assert!(store.retry_set("job").unwrap().is_empty());

        let ids: BTreeSet<String> = ["A2", "A7"].iter().map(|s| s.to_string()).collect();
        store.set_retry_set("job", &ids).unwrap();
        store.set("job", ts(500)).unwrap();

        assert_eq!(store.retry_set("job").unwrap(), ids);
        let checkpoint = store.checkpoint("job").unwrap().unwrap();
        assert_eq!(checkpoint.value, Some(ts(500)));
        assert!(checkpoint.updated_at.is_some());
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state.json"));
        store.set("job", ts(10)).unwrap();

        assert!(store.remove("job").unwrap());
        assert!(!store.remove("job").unwrap());
        assert_eq!(store.read("job").unwrap(), None);
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        let store = FileWatermarkStore::new(&path);
        let err = store.read("job").unwrap_err();
        assert!(err.to_string().contains("Failed to parse sync state"));
    }
}
