//! External id specifications and composite key values.
//!
//! An [`ExternalIdSpec`] names the field(s) that identify a record across the
//! two stores. Parts are either direct fields (`LineIndex`) or relationship
//! traversals (`Rule.Name`). The serialized spec joins parts with `;`; a
//! composite *value* joins the ordered part values with `|`.
//!
//! Part order is fixed once parsed. Decoding a composite value is positional,
//! so reordering parts would silently pair values with the wrong fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::identifier::validate_identifier;
use super::record::{field_value, Record};
use crate::error::{MigrateError, Result};

/// Separator between key parts in a serialized spec.
pub const SPEC_DELIMITER: char = ';';

/// Separator between part values in a composite value.
pub const VALUE_DELIMITER: char = '|';

/// One component of an external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// A field stored directly on the record.
    Field(String),
    /// A field reached through a lookup relationship, e.g. `Rule.Name`.
    Traversal { relationship: String, path: String },
}

impl KeyPart {
    /// Parse a single part.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        validate_identifier(raw)?;
        match raw.split_once('.') {
            Some((relationship, _)) => Ok(KeyPart::Traversal {
                relationship: relationship.to_string(),
                path: raw.to_string(),
            }),
            None => Ok(KeyPart::Field(raw.to_string())),
        }
    }

    /// Field path as used in a query's select list or WHERE clause.
    pub fn path(&self) -> &str {
        match self {
            KeyPart::Field(name) => name,
            KeyPart::Traversal { path, .. } => path,
        }
    }

    /// Lookup field on the record that stores the related record's local id.
    ///
    /// `Rule.Name` resolves through `RuleId`; custom relationships ending in
    /// `__r` resolve through the matching `__c` field.
    pub fn lookup_field(&self) -> Option<String> {
        match self {
            KeyPart::Field(_) => None,
            KeyPart::Traversal { relationship, .. } => Some(lookup_field_for(relationship)),
        }
    }
}

/// Base lookup field name for a relationship name.
pub fn lookup_field_for(relationship: &str) -> String {
    match relationship.strip_suffix("__r") {
        Some(stem) => format!("{}__c", stem),
        None => format!("{}Id", relationship),
    }
}

/// Ordered list of key parts identifying a record across stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalIdSpec {
    parts: Vec<KeyPart>,
}

impl ExternalIdSpec {
    /// Parse a `;`-delimited spec such as `Rule.Name;LineIndex`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts = raw
            .split(SPEC_DELIMITER)
            .map(|p| {
                if p.trim().is_empty() {
                    Err(MigrateError::Config(format!(
                        "External id {:?} has an empty key part",
                        raw
                    )))
                } else {
                    KeyPart::parse(p)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { parts })
    }

    /// Build a single-field spec.
    pub fn single(field: &str) -> Result<Self> {
        Ok(Self {
            parts: vec![KeyPart::parse(field)?],
        })
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn is_composite(&self) -> bool {
        self.parts.len() > 1
    }

    /// Field paths in declared order.
    pub fn paths(&self) -> Vec<&str> {
        self.parts.iter().map(KeyPart::path).collect()
    }

    /// Base lookup fields required by traversal parts, in declared order.
    pub fn lookup_fields(&self) -> Vec<String> {
        self.parts.iter().filter_map(KeyPart::lookup_field).collect()
    }

    /// True if any part's path is `field`.
    pub fn references_field(&self, field: &str) -> bool {
        self.parts.iter().any(|p| p.path().eq_ignore_ascii_case(field))
    }

    /// Encode ordered part values into a single composite value.
    ///
    /// Returns `None` for a composite spec when a part value itself contains
    /// the value delimiter, since the result could not be decoded back into
    /// the same parts.
    pub fn encode_values<S: AsRef<str>>(&self, values: &[S]) -> Option<String> {
        let values: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
        if self.is_composite() && values.iter().any(|v| v.contains(VALUE_DELIMITER)) {
            return None;
        }
        Some(values.join(&VALUE_DELIMITER.to_string()))
    }

    /// Split a value into its positional parts without validation.
    pub fn decode_value(&self, value: &str) -> Vec<String> {
        if self.is_composite() {
            value.split(VALUE_DELIMITER).map(str::to_string).collect()
        } else {
            vec![value.to_string()]
        }
    }

    /// Decode a value, returning `None` unless every part is present and non-empty.
    pub fn decode_complete(&self, value: &str) -> Option<Vec<String>> {
        let values = self.decode_value(value);
        if values.len() == self.parts.len() && values.iter().all(|v| !v.trim().is_empty()) {
            Some(values)
        } else {
            None
        }
    }

    /// Read this spec's value from a record, `None` if any part is missing.
    pub fn value_of(&self, record: &Record) -> Option<String> {
        let values = self
            .parts
            .iter()
            .map(|p| field_value(record, p.path()).filter(|v| !v.is_empty()))
            .collect::<Option<Vec<_>>>()?;
        let encoded = self.encode_values(&values);
        if encoded.is_none() {
            warn!(
                "External id {} value {:?} contains the delimiter {:?} and cannot be matched",
                self, values, VALUE_DELIMITER
            );
        }
        encoded
    }
}

impl fmt::Display for ExternalIdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self.paths().join(&SPEC_DELIMITER.to_string());
        f.write_str(&joined)
    }
}

impl TryFrom<String> for ExternalIdSpec {
    type Error = MigrateError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ExternalIdSpec> for String {
    fn from(spec: ExternalIdSpec) -> Self {
        spec.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single() {
        let spec = ExternalIdSpec::parse("Name").unwrap();
        assert!(!spec.is_composite());
        assert_eq!(spec.paths(), vec!["Name"]);
        assert!(spec.lookup_fields().is_empty());
    }

    #[test]
    fn test_parse_composite_with_traversal() {
        let spec = ExternalIdSpec::parse("Rule.Name;LineIndex").unwrap();
        assert!(spec.is_composite());
        assert_eq!(spec.paths(), vec!["Rule.Name", "LineIndex"]);
        assert_eq!(spec.lookup_fields(), vec!["RuleId".to_string()]);
        assert_eq!(spec.to_string(), "Rule.Name;LineIndex");
    }

    #[test]
    fn test_custom_relationship_lookup() {
        let part = KeyPart::parse("Price_Rule__r.Name").unwrap();
        assert_eq!(part.lookup_field().as_deref(), Some("Price_Rule__c"));
    }

    #[test]
    fn test_empty_part_rejected() {
        assert!(ExternalIdSpec::parse("Name;").is_err());
        assert!(ExternalIdSpec::parse("").is_err());
    }

    #[test]
    fn test_decode_complete_rejects_partial() {
        let spec = ExternalIdSpec::parse("Rule.Name;LineIndex").unwrap();
        assert_eq!(
            spec.decode_complete("R1|3"),
            Some(vec!["R1".to_string(), "3".to_string()])
        );
        assert_eq!(spec.decode_complete("R1|"), None);
        assert_eq!(spec.decode_complete("R1"), None);
        assert_eq!(spec.decode_complete("R1|3|x"), None);
    }

    #[test]
    fn test_value_of_record() {
        let spec = ExternalIdSpec::parse("Rule.Name;LineIndex").unwrap();
        let record = json!({"Id": "t1", "Rule": {"Name": "R1"}, "LineIndex": 2});
        let record = record.as_object().unwrap().clone();
        assert_eq!(spec.value_of(&record).as_deref(), Some("R1|2"));

        let missing = json!({"Id": "t2", "Rule": null, "LineIndex": 2});
        assert_eq!(spec.value_of(missing.as_object().unwrap()), None);
    }

    #[test]
    fn test_delimiter_in_part_value_rejected() {
        let spec = ExternalIdSpec::parse("Rule.Name;LineIndex").unwrap();
        assert_eq!(spec.encode_values(&["R|1", "2"]), None);
        assert_eq!(spec.encode_values(&["R1", "2"]).as_deref(), Some("R1|2"));

        let record = json!({"Rule": {"Name": "A|B"}, "LineIndex": 2});
        assert_eq!(spec.value_of(record.as_object().unwrap()), None);

        // A single-part value is never split, so the delimiter is harmless
        let single = ExternalIdSpec::parse("Name").unwrap();
        assert_eq!(single.encode_values(&["A|B"]).as_deref(), Some("A|B"));
    }

    #[test]
    fn test_serde_as_string() {
        let spec: ExternalIdSpec = serde_json::from_str("\"Rule.Name;LineIndex\"").unwrap();
        assert_eq!(serde_json::to_string(&spec).unwrap(), "\"Rule.Name;LineIndex\"");
        assert!(serde_json::from_str::<ExternalIdSpec>("\"Bad Field\"").is_err());
    }
}
