//! Identifier validation and literal quoting for generated queries.
//!
//! Object types and field names cannot be bound as parameters in the store's
//! query language, so they are validated before being spliced into a query.
//! Values are always emitted as quoted string literals with the store's
//! backslash escaping.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{MigrateError, Result};

/// Maximum identifier length accepted for object types and field paths.
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Validate an object type name or field path.
///
/// Accepts ASCII letters, digits and underscores, with `.` separating
/// relationship traversal segments. Each segment must start with a letter.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    for segment in name.split('.') {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => {
                return Err(MigrateError::Config(format!(
                    "Invalid identifier segment {:?} in {:?}",
                    segment, name
                )))
            }
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(MigrateError::Config(format!(
                "Identifier contains unsupported characters: {:?}",
                name
            )));
        }
    }

    Ok(())
}

/// Quote a value as a string literal.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(quote_literal("O'Brien"), "'O\\'Brien'");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Render `field IN ('a','b')`.
pub fn in_list<S: AsRef<str>>(field: &str, values: &[S]) -> String {
    let literals: Vec<String> = values.iter().map(|v| quote_literal(v.as_ref())).collect();
    format!("{} IN ({})", field, literals.join(","))
}

/// Render a datetime literal (unquoted, UTC, second precision).
pub fn datetime_literal(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
