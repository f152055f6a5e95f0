// ABOUTME: TOML configuration for the article sync job
// ABOUTME: Source table mapping, local store location, and watermark/daemon settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::clock::Timestamp;
use crate::sync::reconciler::ReconcileConfig;
use crate::sync::source::ColumnMapping;
use crate::sync::watermark::{sentinel_epoch, DEFAULT_WATERMARK_KEY};
use crate::utils::{parse_timestamp, validate_identifier};

/// Top-level configuration file.
///
/// ```toml
/// [source]
/// path = "external.db"
/// table = "articles"
///
/// [store]
/// path = ".article-sync/content.db"
///
/// [sync]
/// interval_secs = 3600
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub sync: JobConfig,
}

/// Where external articles are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// SQLite database holding the article table
    pub path: PathBuf,
    pub table: String,
    pub id_column: String,
    pub content_column: String,
    pub changed_column: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        let columns = ColumnMapping::default();
        Self {
            path: PathBuf::from("external.db"),
            table: "articles".to_string(),
            id_column: columns.id_column,
            content_column: columns.content_column,
            changed_column: columns.changed_column,
        }
    }
}

/// Local content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Entity type articles are mirrored into
    pub entity_type: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".article-sync/content.db"),
            entity_type: "article".to_string(),
        }
    }
}

/// Watermark and scheduling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub watermark_key: String,
    /// Watermark before the first completed run (RFC 3339 or unix seconds).
    /// Unset means the sentinel epoch, i.e. sync everything.
    pub initial_watermark: Option<String>,
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    /// Seconds between daemon cycles
    pub interval_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            watermark_key: DEFAULT_WATERMARK_KEY.to_string(),
            initial_watermark: None,
            state_path: PathBuf::from(".article-sync/state.json"),
            lock_path: PathBuf::from(".article-sync/sync.lock"),
            interval_secs: 3600,
        }
    }
}

impl SyncConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never produce a working sync.
    pub fn validate(&self) -> Result<()> {
        for (what, name) in [
            ("source table", &self.source.table),
            ("id column", &self.source.id_column),
            ("content column", &self.source.content_column),
            ("changed column", &self.source.changed_column),
        ] {
            validate_identifier(name).with_context(|| format!("Invalid {}", what))?;
        }
        if self.store.entity_type.trim().is_empty() {
            anyhow::bail!("Entity type cannot be empty");
        }
        if self.sync.watermark_key.trim().is_empty() {
            anyhow::bail!("Watermark key cannot be empty");
        }
        if self.sync.interval_secs == 0 {
            anyhow::bail!("Sync interval must be at least one second");
        }
        self.initial_watermark()?;
        Ok(())
    }

    pub fn initial_watermark(&self) -> Result<Timestamp> {
        match &self.sync.initial_watermark {
            Some(value) => parse_timestamp(value).context("Invalid initial_watermark"),
            None => Ok(sentinel_epoch()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn column_mapping(&self) -> ColumnMapping {
        ColumnMapping {
            id_column: self.source.id_column.clone(),
            content_column: self.source.content_column.clone(),
            changed_column: self.source.changed_column.clone(),
        }
    }

    /// Reconciler settings derived from this configuration.
    pub fn reconcile_config(&self) -> Result<ReconcileConfig> {
        Ok(ReconcileConfig {
            table: self.source.table.clone(),
            entity_type: self.store.entity_type.clone(),
            watermark_key: self.sync.watermark_key.clone(),
            initial_watermark: self.initial_watermark()?,
            columns: self.column_mapping(),
        })
    }
}
