// ABOUTME: SQLite to JSON value conversion for external rows
// ABOUTME: Keeps every column lossless so unmapped fields travel opaquely with the record

use anyhow::{Context, Result};
use rusqlite::types::Value;
use serde_json::Value as JsonValue;

use crate::sync::source::Row;

/// Convert a single SQLite value to JSON
///
/// - INTEGER → number (i64)
/// - REAL → number (f64), non-finite values as strings
/// - TEXT → string
/// - BLOB → `{"_type": "blob", "data": "<base64>"}`
/// - NULL → null
pub fn sqlite_value_to_json(value: &Value) -> Result<JsonValue> {
    match value {
        Value::Null => Ok(JsonValue::Null),

        Value::Integer(i) => Ok(JsonValue::Number((*i).into())),

        Value::Real(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f)
                    .map(JsonValue::Number)
                    .ok_or_else(|| anyhow::anyhow!("Failed to convert float {} to JSON number", f))
            } else {
                Ok(JsonValue::String(f.to_string()))
            }
        }

        Value::Text(s) => Ok(JsonValue::String(s.clone())),

        Value::Blob(b) => {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b);
            Ok(serde_json::json!({
                "_type": "blob",
                "data": encoded
            }))
        }
    }
}

/// Read the columns of a result row into a [`Row`].
pub fn read_row(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in columns.iter().enumerate() {
        let value: Value = row
            .get(idx)
            .with_context(|| format!("Failed to read column '{}'", column))?;
        let json = sqlite_value_to_json(&value)
            .with_context(|| format!("Failed to convert column '{}' to JSON", column))?;
        out.insert(column.clone(), json);
    }
    Ok(out)
}
