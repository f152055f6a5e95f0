// ABOUTME: Error taxonomy for article sync
// ABOUTME: Source failures degrade a run to "no rows"; record failures skip a single article

use std::fmt;

use thiserror::Error;

use super::repository::EntityId;

/// Failure to obtain rows from the external source.
///
/// The reconciler never propagates these: a run that cannot read the source
/// ends with zero processed records and an untouched watermark.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("unable to get the structure for {table}: {message}")]
    Introspection { table: String, message: String },

    #[error("table {table} has no columns")]
    NoColumns { table: String },

    #[error("table {table} has no column named {column}")]
    MissingColumn { table: String, column: String },

    #[error("query against {table} failed: {message}")]
    Query { table: String, message: String },
}

/// Failure to mirror a single external record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("row is missing required column '{0}'")]
    MissingField(String),

    #[error("column '{column}' holds an unusable value: {value}")]
    InvalidField { column: String, value: String },

    #[error("lookup by external id failed: {0}")]
    Lookup(String),

    #[error("entity {id} could not be loaded: {message}")]
    Load { id: EntityId, message: String },

    #[error("entity could not be created: {0}")]
    Create(String),

    #[error("repository rejected the save of entity {0}")]
    SaveRejected(EntityId),

    #[error("saving entity {id} failed: {message}")]
    Save { id: EntityId, message: String },

    #[error("content for entity {0} did not save correctly")]
    SaveVerification(EntityId),
}

/// What the reconciler was doing when a record failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Lookup,
    Create,
    Update,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertAction::Lookup => write!(f, "looking up"),
            UpsertAction::Create => write!(f, "adding"),
            UpsertAction::Update => write!(f, "updating"),
        }
    }
}

/// A record failure tagged with the article it belongs to.
#[derive(Debug, Error)]
#[error("{action} article {external_id} failed: {error}")]
pub struct UpsertError {
    pub external_id: String,
    pub action: UpsertAction,
    #[source]
    pub error: RecordError,
}

impl UpsertError {
    pub fn new(external_id: impl Into<String>, action: UpsertAction, error: RecordError) -> Self {
        Self {
            external_id: external_id.into(),
            action,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_error_display() {
        let err = UpsertError::new("A2", UpsertAction::Create, RecordError::SaveRejected(EntityId(7)));
        assert_eq!(
            err.to_string(),
            "adding article A2 failed: repository rejected the save of entity 7"
        );
    }

    #[test]
    fn test_source_error_display() {
        let err = SourceError::MissingColumn {
            table: "articles".to_string(),
            column: "updated_at".to_string(),
        };
        assert_eq!(err.to_string(), "table articles has no column named updated_at");
    }
}
