// ABOUTME: External source reader - fetches article rows changed since the watermark
// ABOUTME: Introspects columns dynamically and decodes rows into typed ExternalRecords

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use super::clock::Timestamp;
use super::error::{RecordError, SourceError};
use crate::utils::{from_unix_seconds, parse_timestamp};

/// One row from the external source, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Raw capability of the external relational source.
///
/// Implementations validate and quote every identifier they put into SQL.
/// Row order is whatever the source returns.
pub trait ExternalSource {
    /// Column names of `table`, in declaration order.
    fn describe_table(&self, table: &str) -> Result<Vec<String>, SourceError>;

    /// Rows whose `changed_column` is strictly greater than `since`.
    fn select_changed(
        &self,
        table: &str,
        columns: &[String],
        changed_column: &str,
        since: Timestamp,
    ) -> Result<Vec<Row>, SourceError>;

    /// Rows whose `id_column` (compared as text) is one of `ids`.
    fn select_by_ids(
        &self,
        table: &str,
        columns: &[String],
        id_column: &str,
        ids: &[String],
    ) -> Result<Vec<Row>, SourceError>;
}

impl<S: ExternalSource + ?Sized> ExternalSource for &S {
    fn describe_table(&self, table: &str) -> Result<Vec<String>, SourceError> {
        (**self).describe_table(table)
    }

    fn select_changed(
        &self,
        table: &str,
        columns: &[String],
        changed_column: &str,
        since: Timestamp,
    ) -> Result<Vec<Row>, SourceError> {
        (**self).select_changed(table, columns, changed_column, since)
    }

    fn select_by_ids(
        &self,
        table: &str,
        columns: &[String],
        id_column: &str,
        ids: &[String],
    ) -> Result<Vec<Row>, SourceError> {
        (**self).select_by_ids(table, columns, id_column, ids)
    }
}

/// Columns the reconciler interprets; everything else is carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub id_column: String,
    pub content_column: String,
    pub changed_column: String,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            id_column: "id".to_string(),
            content_column: "content".to_string(),
            changed_column: "updated_at".to_string(),
        }
    }
}

impl ColumnMapping {
    fn required(&self) -> [&str; 3] {
        [&self.id_column, &self.content_column, &self.changed_column]
    }
}

/// Result of asking the source for rows.
///
/// Never an error: an unreachable source and an empty window both mean
/// "nothing to do", but callers can tell them apart for diagnostics.
#[derive(Debug)]
pub enum FetchOutcome {
    Rows(Vec<Row>),
    Empty,
    Unavailable(SourceError),
}

impl FetchOutcome {
    fn from_rows(rows: Vec<Row>) -> Self {
        if rows.is_empty() {
            FetchOutcome::Empty
        } else {
            FetchOutcome::Rows(rows)
        }
    }
}

/// Contract wrapper over an [`ExternalSource`].
pub struct SourceReader<S> {
    source: S,
    mapping: ColumnMapping,
}

impl<S: ExternalSource> SourceReader<S> {
    pub fn new(source: S, mapping: ColumnMapping) -> Self {
        Self { source, mapping }
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    /// Discover the full column set of `table` and check the mapped columns exist.
    pub fn discover_columns(&self, table: &str) -> Result<Vec<String>, SourceError> {
        let columns = self.source.describe_table(table)?;
        if columns.is_empty() {
            return Err(SourceError::NoColumns {
                table: table.to_string(),
            });
        }

        for required in self.mapping.required() {
            if !columns.iter().any(|c| c == required) {
                return Err(SourceError::MissingColumn {
                    table: table.to_string(),
                    column: required.to_string(),
                });
            }
        }

        tracing::debug!("Table {} has {} columns: {:?}", table, columns.len(), columns);
        Ok(columns)
    }

    /// All rows of `table` changed strictly after `since`.
    pub fn fetch_changed(&self, table: &str, since: Timestamp) -> FetchOutcome {
        let columns = match self.discover_columns(table) {
            Ok(columns) => columns,
            Err(e) => return FetchOutcome::Unavailable(e),
        };

        match self
            .source
            .select_changed(table, &columns, &self.mapping.changed_column, since)
        {
            Ok(rows) => {
                tracing::debug!("Read {} changed rows from {} since {}", rows.len(), table, since);
                FetchOutcome::from_rows(rows)
            }
            Err(e) => FetchOutcome::Unavailable(e),
        }
    }

    /// Rows of `table` with the given external ids, regardless of change time.
    pub fn fetch_by_ids(&self, table: &str, ids: &[String]) -> FetchOutcome {
        if ids.is_empty() {
            return FetchOutcome::Empty;
        }

        let columns = match self.discover_columns(table) {
            Ok(columns) => columns,
            Err(e) => return FetchOutcome::Unavailable(e),
        };

        match self
            .source
            .select_by_ids(table, &columns, &self.mapping.id_column, ids)
        {
            Ok(rows) => FetchOutcome::from_rows(rows),
            Err(e) => FetchOutcome::Unavailable(e),
        }
    }
}

/// Stable identifier of an article in the external source.
pub type ExternalId = String;

/// A decoded row for one logical article.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalRecord {
    pub external_id: ExternalId,
    pub content: String,
    /// Change time as reported by the source; only the query filters on it
    pub changed_at: Option<Timestamp>,
    /// Every other column, preserved as read
    pub extra: BTreeMap<String, Value>,
}

impl ExternalRecord {
    /// Decode a source row using `mapping`.
    pub fn from_row(mut row: Row, mapping: &ColumnMapping) -> Result<Self, RecordError> {
        let external_id = decode_id(row.remove(&mapping.id_column), &mapping.id_column)?;
        let content = decode_content(row.remove(&mapping.content_column), &mapping.content_column)?;
        let changed_at =
            match decode_timestamp(row.remove(&mapping.changed_column), &mapping.changed_column) {
                Ok(at) => Some(at),
                Err(e) => {
                    tracing::debug!("Article {} has no usable change time: {}", external_id, e);
                    None
                }
            };

        Ok(Self {
            external_id,
            content,
            changed_at,
            extra: row,
        })
    }
}

/// The external id of a row, if it has a usable one. Used to attribute
/// decode failures to an article.
pub fn row_external_id(row: &Row, mapping: &ColumnMapping) -> Option<ExternalId> {
    decode_id(row.get(&mapping.id_column).cloned(), &mapping.id_column).ok()
}

/// External ids present in `rows`.
pub fn row_external_ids(rows: &[Row], mapping: &ColumnMapping) -> HashSet<ExternalId> {
    rows.iter()
        .filter_map(|row| row_external_id(row, mapping))
        .collect()
}

fn decode_id(value: Option<Value>, column: &str) -> Result<ExternalId, RecordError> {
    match value {
        None | Some(Value::Null) => Err(RecordError::MissingField(column.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => Err(RecordError::InvalidField {
            column: column.to_string(),
            value: "empty string".to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(RecordError::InvalidField {
            column: column.to_string(),
            value: other.to_string(),
        }),
    }
}

fn decode_content(value: Option<Value>, column: &str) -> Result<String, RecordError> {
    match value {
        None => Err(RecordError::MissingField(column.to_string())),
        Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(RecordError::InvalidField {
            column: column.to_string(),
            value: other.to_string(),
        }),
    }
}

fn decode_timestamp(value: Option<Value>, column: &str) -> Result<Timestamp, RecordError> {
    let invalid = |value: String| RecordError::InvalidField {
        column: column.to_string(),
        value,
    };

    match value {
        None | Some(Value::Null) => Err(RecordError::MissingField(column.to_string())),
        Some(Value::Number(n)) => {
            let secs = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.floor() as i64))
                .ok_or_else(|| invalid(n.to_string()))?;
            from_unix_seconds(secs).map_err(|_| invalid(n.to_string()))
        }
        Some(Value::String(s)) => parse_timestamp(&s).map_err(|_| invalid(s)),
        Some(other) => Err(invalid(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::cell::RefCell;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_from_row_decodes_required_and_extra_columns() {
        let record = ExternalRecord::from_row(
            row(&[
                ("id", json!(42)),
                ("content", json!("Hello")),
                ("updated_at", json!(1_700_000_000)),
                ("author", json!("Ada")),
            ]),
            &ColumnMapping::default(),
        )
        .unwrap();

        assert_eq!(record.external_id, "42");
        assert_eq!(record.content, "Hello");
        assert_eq!(
            record.changed_at,
            Some(chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap())
        );
        assert_eq!(record.extra.len(), 1);
        assert_eq!(record.extra["author"], json!("Ada"));
    }

    #[test]
    fn test_from_row_accepts_text_timestamps_and_null_content() {
        let record = ExternalRecord::from_row(
            row(&[
                ("id", json!("A1")),
                ("content", Value::Null),
                ("updated_at", json!("2024-03-01 08:00:00")),
            ]),
            &ColumnMapping::default(),
        )
        .unwrap();

        assert_eq!(record.external_id, "A1");
        assert_eq!(record.content, "");
        assert_eq!(
            record.changed_at,
            Some(chrono::Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_from_row_rejects_missing_id() {
        let err = ExternalRecord::from_row(
            row(&[("content", json!("x")), ("updated_at", json!(1))]),
            &ColumnMapping::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::MissingField(ref c) if c == "id"));
    }

    #[test]
    fn test_from_row_tolerates_unreadable_change_time() {
        let record = ExternalRecord::from_row(
            row(&[
                ("id", json!(1)),
                ("content", json!("x")),
                ("updated_at", json!("last tuesday")),
            ]),
            &ColumnMapping::default(),
        )
        .unwrap();
        assert_eq!(record.external_id, "1");
        assert_eq!(record.content, "x");
        assert_eq!(record.changed_at, None);
    }

    #[test]
    fn test_from_row_rejects_structured_content() {
        let err = ExternalRecord::from_row(
            row(&[
                ("id", json!(1)),
                ("content", json!({"blocks": []})),
                ("updated_at", json!(1)),
            ]),
            &ColumnMapping::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RecordError::InvalidField { ref column, .. } if column == "content"));
    }

    #[test]
    fn test_row_external_id_for_attribution() {
        let mapping = ColumnMapping::default();
        assert_eq!(
            row_external_id(&row(&[("id", json!(7))]), &mapping),
            Some("7".to_string())
        );
        assert_eq!(row_external_id(&row(&[("id", Value::Null)]), &mapping), None);
    }

    /// Source that records the calls made to it.
    struct ScriptedSource {
        columns: Result<Vec<String>, String>,
        rows: Vec<Row>,
        selects: RefCell<Vec<Timestamp>>,
    }

    impl ExternalSource for ScriptedSource {
        fn describe_table(&self, table: &str) -> Result<Vec<String>, SourceError> {
            self.columns.clone().map_err(|message| SourceError::Introspection {
                table: table.to_string(),
                message,
            })
        }

        fn select_changed(
            &self,
            _table: &str,
            _columns: &[String],
            _changed_column: &str,
            since: Timestamp,
        ) -> Result<Vec<Row>, SourceError> {
            self.selects.borrow_mut().push(since);
            Ok(self.rows.clone())
        }

        fn select_by_ids(
            &self,
            _table: &str,
            _columns: &[String],
            _id_column: &str,
            ids: &[String],
        ) -> Result<Vec<Row>, SourceError> {
            Ok(self
                .rows
                .iter()
                .filter(|r| {
                    r.get("id")
                        .and_then(|v| v.as_str())
                        .is_some_and(|id| ids.iter().any(|i| i == id))
                })
                .cloned()
                .collect())
        }
    }

    fn columns(names: &[&str]) -> Result<Vec<String>, String> {
        Ok(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_fetch_changed_introspection_failure_is_unavailable() {
        let reader = SourceReader::new(
            ScriptedSource {
                columns: Err("no such table".to_string()),
                rows: vec![],
                selects: RefCell::new(vec![]),
            },
            ColumnMapping::default(),
        );

        let outcome = reader.fetch_changed("articles", chrono::Utc::now());
        assert!(matches!(
            outcome,
            FetchOutcome::Unavailable(SourceError::Introspection { .. })
        ));
        assert!(reader.source.selects.borrow().is_empty());
    }

    #[test]
    fn test_fetch_changed_missing_mapped_column_is_unavailable() {
        let reader = SourceReader::new(
            ScriptedSource {
                columns: columns(&["id", "content"]),
                rows: vec![],
                selects: RefCell::new(vec![]),
            },
            ColumnMapping::default(),
        );

        let outcome = reader.fetch_changed("articles", chrono::Utc::now());
        assert!(matches!(
            outcome,
            FetchOutcome::Unavailable(SourceError::MissingColumn { ref column, .. }) if column == "updated_at"
        ));
    }

    #[test]
    fn test_fetch_changed_empty_and_rows() {
        let since = chrono::Utc.timestamp_opt(100, 0).unwrap();
        let empty = SourceReader::new(
            ScriptedSource {
                columns: columns(&["id", "content", "updated_at"]),
                rows: vec![],
                selects: RefCell::new(vec![]),
            },
            ColumnMapping::default(),
        );
        assert!(matches!(empty.fetch_changed("articles", since), FetchOutcome::Empty));
        assert_eq!(*empty.source.selects.borrow(), vec![since]);

        let full = SourceReader::new(
            ScriptedSource {
                columns: columns(&["id", "content", "updated_at"]),
                rows: vec![row(&[("id", json!("A1"))])],
                selects: RefCell::new(vec![]),
            },
            ColumnMapping::default(),
        );
        match full.fetch_changed("articles", since) {
            FetchOutcome::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_by_ids_skips_source_for_empty_ids() {
        let reader = SourceReader::new(
            ScriptedSource {
                columns: Err("unreachable".to_string()),
                rows: vec![],
                selects: RefCell::new(vec![]),
            },
            ColumnMapping::default(),
        );
        assert!(matches!(reader.fetch_by_ids("articles", &[]), FetchOutcome::Empty));
    }
}
