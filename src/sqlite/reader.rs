// ABOUTME: SQLite external source - introspects the article table and reads changed rows
// ABOUTME: Implements ExternalSource over a read-only rusqlite connection

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use super::converter::read_row;
use crate::sync::clock::Timestamp;
use crate::sync::error::SourceError;
use crate::sync::source::{ExternalSource, Row};
use crate::utils::{quote_ident, validate_identifier};

/// SQLite's default limit on bound parameters is 999; stay well under it.
const ID_CHUNK_SIZE: usize = 500;

/// External article source stored in a SQLite database.
///
/// The change column may hold unix seconds (as numbers or digit-only text) or
/// any date string SQLite's `strftime` understands; all are compared as unix
/// seconds.
pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    /// Open the database read-only. The file must already exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("External database {} does not exist", path.display());
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open external database {}", path.display()))?;

        tracing::debug!("Opened external SQLite source at {}", path.display());
        Ok(Self { conn })
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn query_rows<P: rusqlite::Params>(
        &self,
        table: &str,
        sql: &str,
        columns: &[String],
        params: P,
    ) -> Result<Vec<Row>, SourceError> {
        let query_error = |message: String| SourceError::Query {
            table: table.to_string(),
            message,
        };

        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| query_error(e.to_string()))?;
        let mut rows = stmt.query(params).map_err(|e| query_error(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| query_error(e.to_string()))? {
            out.push(read_row(row, columns).map_err(|e| query_error(format!("{:#}", e)))?);
        }
        Ok(out)
    }
}

fn check_identifier(name: &str) -> Result<(), SourceError> {
    validate_identifier(name).map_err(|e| SourceError::InvalidIdentifier {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// SQL yielding `column` as unix seconds.
///
/// Numbers and digit-only text are taken as unix seconds; other text goes
/// through `strftime`, whose accepted layouts match `parse_timestamp`.
fn unix_seconds_expr(column: &str) -> String {
    format!(
        "(CASE WHEN typeof({c}) IN ('integer', 'real') THEN {c} \
         WHEN CAST(CAST({c} AS INTEGER) AS TEXT) = trim({c}) THEN CAST({c} AS INTEGER) \
         ELSE CAST(strftime('%s', {c}) AS INTEGER) END)",
        c = column
    )
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ExternalSource for SqliteSource {
    fn describe_table(&self, table: &str) -> Result<Vec<String>, SourceError> {
        check_identifier(table)?;

        let introspection_error = |e: rusqlite::Error| SourceError::Introspection {
            table: table.to_string(),
            message: e.to_string(),
        };

        let query = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.conn.prepare(&query).map_err(introspection_error)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(introspection_error)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(introspection_error)?;

        Ok(columns)
    }

    fn select_changed(
        &self,
        table: &str,
        columns: &[String],
        changed_column: &str,
        since: Timestamp,
    ) -> Result<Vec<Row>, SourceError> {
        check_identifier(table)?;
        check_identifier(changed_column)?;

        let query = format!(
            "SELECT {} FROM {} WHERE {} > ?1",
            column_list(columns),
            quote_ident(table),
            unix_seconds_expr(&quote_ident(changed_column))
        );

        self.query_rows(table, &query, columns, [since.timestamp()])
    }

    fn select_by_ids(
        &self,
        table: &str,
        columns: &[String],
        id_column: &str,
        ids: &[String],
    ) -> Result<Vec<Row>, SourceError> {
        check_identifier(table)?;
        check_identifier(id_column)?;

        let mut rows = Vec::new();
        for chunk in ids.chunks(ID_CHUNK_SIZE) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let query = format!(
                "SELECT {} FROM {} WHERE CAST({} AS TEXT) IN ({})",
                column_list(columns),
                quote_ident(table),
                quote_ident(id_column),
                placeholders
            );
            rows.extend(self.query_rows(
                table,
                &query,
                columns,
                rusqlite::params_from_iter(chunk.iter()),
            )?);
        }
        Ok(rows)
    }
}
