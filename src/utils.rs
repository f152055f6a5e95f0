// ABOUTME: Utility functions for identifier safety and timestamp parsing
// ABOUTME: Shared by the SQLite source, the entity store, and the CLI

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Validate a SQL identifier (table or column name)
///
/// Identifiers discovered through schema introspection or given in the
/// configuration end up inside generated SQL, so they are restricted to
/// letters, digits and underscores and must not start with a digit.
///
/// # Examples
///
/// ```
/// # use article_sync::utils::validate_identifier;
/// assert!(validate_identifier("articles").is_ok());
/// assert!(validate_identifier("updated_at").is_ok());
/// assert!(validate_identifier("1articles").is_err());
/// assert!(validate_identifier("articles; DROP TABLE articles").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let first_char = trimmed.chars().next().unwrap_or('_');
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        bail!(
            "Identifier '{}' must start with a letter or underscore, not '{}'",
            sanitize_identifier(trimmed),
            first_char
        );
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display in logs and error messages.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a SQL identifier, escaping embedded double quotes.
///
/// Assumes the identifier has already been validated.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Text layouts SQLite's date functions understand, without an offset.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// The same layouts followed by a `+HH:MM` offset.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%dT%H:%M%:z",
];

/// Parse a user- or source-supplied timestamp.
///
/// Accepts unix seconds (`1290540978`), RFC 3339
/// (`2024-01-01T00:00:00Z`) and the layouts SQLite's `strftime` reads:
/// `YYYY-MM-DD HH:MM[:SS[.fff]]` with a space or `T`, an optional `Z` or
/// `+HH:MM` suffix, and a bare `YYYY-MM-DD`. Values without an offset are UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(secs) = value.parse::<i64>() {
        return from_unix_seconds(secs);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    // SQLite treats a trailing Z as +00:00
    let value = value.strip_suffix(['Z', 'z']).unwrap_or(value);

    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(value, format) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid timestamp '{}'", value))?;
    Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::default())))
}

/// Convert unix seconds to a UTC timestamp.
pub fn from_unix_seconds(secs: i64) -> Result<DateTime<Utc>> {
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(ts) => Ok(ts),
        _ => bail!("Unix timestamp {} is out of range", secs),
    }
}
