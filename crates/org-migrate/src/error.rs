//! Error types for the migration library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, unresolvable external id, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relationship/phase graph failed load-time validation
    #[error("Graph error: {0}")]
    Graph(String),

    /// A store rejected a query or returned an unusable response
    #[error("Query failed for {object}: {message}")]
    StoreQuery { object: String, message: String },

    /// Reconciliation could not determine which records a run created
    #[error("Cannot identify created records for {object}: {message}")]
    AmbiguousIdentity { object: String, message: String },

    /// Not a single object could be processed
    #[error("Nothing processed: {0}")]
    NothingProcessed(String),

    /// HTTP transport error talking to a store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot file read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MigrateError {
    /// Create a StoreQuery error
    pub fn store(object: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::StoreQuery {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Create an AmbiguousIdentity error
    pub fn ambiguous(object: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::AmbiguousIdentity {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Stable kind string reported to the host alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrateError::Config(_) | MigrateError::Graph(_) | MigrateError::Yaml(_) => {
                "configuration"
            }
            MigrateError::StoreQuery { .. } | MigrateError::Http(_) => "store_query",
            MigrateError::AmbiguousIdentity { .. } => "ambiguous_identity",
            MigrateError::NothingProcessed(_) => "nothing_processed",
            MigrateError::Io(_) | MigrateError::Csv(_) => "io",
            MigrateError::Json(_) => "serialization",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Graph(_) | MigrateError::Yaml(_) => 1,
            MigrateError::StoreQuery { .. } | MigrateError::Http(_) => 2,
            MigrateError::AmbiguousIdentity { .. } => 3,
            MigrateError::NothingProcessed(_) => 4,
            MigrateError::Io(_) | MigrateError::Csv(_) => 7,
            MigrateError::Json(_) => 10,
        }
    }

    /// Structured form of this error (kind + message).
    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Serializable error value handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}

/// A per-object problem that did not abort the surrounding operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectWarning {
    pub object_type: String,
    pub kind: String,
    pub message: String,
}

impl ObjectWarning {
    pub fn new(object_type: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    /// Build a warning from an error caught while processing one object.
    pub fn from_error(object_type: impl Into<String>, err: &MigrateError) -> Self {
        Self::new(object_type, err.kind(), err.to_string())
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_exit_code() {
        let err = MigrateError::store("Rule", "MALFORMED_QUERY");
        assert_eq!(err.kind(), "store_query");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "Query failed for Rule: MALFORMED_QUERY");

        let err = MigrateError::Config("missing".into());
        assert_eq!(err.to_report().kind, "configuration");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_warning_from_error() {
        let err = MigrateError::ambiguous("RuleLine", "no strategy matched");
        let warning = ObjectWarning::from_error("RuleLine", &err);
        assert_eq!(warning.kind, "ambiguous_identity");
        assert!(warning.message.contains("no strategy matched"));
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "plan.json");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: plan.json"));
    }
}
