//! Record representation returned by the store query collaborator.
//!
//! Records are JSON objects. Relationship traversals come back nested
//! (`{"Rule": {"Name": "R1"}}`), so field access walks dotted paths.

use serde_json::{Map, Value};

/// A single record as returned by a query.
pub type Record = Map<String, Value>;

/// Metadata key attached to every record by the query API.
pub const ATTRIBUTES_KEY: &str = "attributes";

/// Store-local identifier field.
pub const ID_FIELD: &str = "Id";

/// Render a scalar as the text written to snapshot files.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // Compound values (addresses, geolocations) are kept as JSON text
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Look up a possibly dotted field path, case-insensitively per segment.
pub fn field_value(record: &Record, path: &str) -> Option<String> {
    let mut current: &Record = record;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = get_ci(current, segment)?;
        if segments.peek().is_none() {
            return value_to_string(value);
        }
        current = value.as_object()?;
    }
    None
}

/// The record's store-local id, if present.
pub fn record_id(record: &Record) -> Option<String> {
    field_value(record, ID_FIELD).filter(|id| !id.is_empty())
}

/// Flatten nested relationship objects into dotted columns, dropping API metadata.
pub fn flatten(record: &Record) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(record, "", &mut out);
    out
}

fn flatten_into(record: &Record, prefix: &str, out: &mut Vec<(String, String)>) {
    for (key, value) in record {
        if key == ATTRIBUTES_KEY {
            continue;
        }
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Object(nested) if nested.contains_key(ATTRIBUTES_KEY) => {
                flatten_into(nested, &name, out)
            }
            other => out.push((name, value_to_string(other).unwrap_or_default())),
        }
    }
}

fn get_ci<'a>(record: &'a Record, key: &str) -> Option<&'a Value> {
    record.get(key).or_else(|| {
        record
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}
