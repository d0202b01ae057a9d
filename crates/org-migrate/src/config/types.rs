//! Configuration type definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Organization records are read from.
    pub source: OrgConfig,

    /// Organization records are written to.
    pub target: OrgConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Object types, phases and relationships.
    pub graph: GraphConfig,
}

/// Connection descriptor for one organization.
#[derive(Clone, Serialize, Deserialize)]
pub struct OrgConfig {
    /// Alias used in plan documents and logs.
    pub alias: String,

    /// Base URL of the organization's API.
    pub instance_url: String,

    /// API version (default: "59.0").
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Username of the integration user (used by reconciliation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Name of the environment variable holding the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_env: Option<String>,

    /// Inline access token. Prefer `access_token_env`.
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
}

impl fmt::Debug for OrgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrgConfig")
            .field("alias", &self.alias)
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .field("username", &self.username)
            .field("access_token_env", &self.access_token_env)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Per-object operation handed to the transfer tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Operation {
    /// Pure create.
    Insert,
    Update,
    #[default]
    Upsert,
    Delete,
    /// Read for lookups only, nothing written.
    Readonly,
}

impl Operation {
    /// True for operations that only create records.
    pub fn is_pure_create(self) -> bool {
        matches!(self, Operation::Insert)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Insert => "Insert",
            Operation::Update => "Update",
            Operation::Upsert => "Upsert",
            Operation::Delete => "Delete",
            Operation::Readonly => "Readonly",
        };
        f.write_str(s)
    }
}

/// What to do with a composite value that is missing parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialValuePolicy {
    /// Drop the value and log a warning.
    #[default]
    Warn,
    /// Drop the value quietly.
    Silent,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Global operation. Falls back to upsert when not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    /// Per-phase operation overrides.
    #[serde(default)]
    pub phase_operations: BTreeMap<u32, Operation>,

    /// Only migrate records modified at or after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_since: Option<DateTime<Utc>>,

    /// Extra WHERE fragments per object type, `AND`-separated.
    #[serde(default)]
    pub custom_filters: BTreeMap<String, String>,

    /// Transactional object types that must never carry live records.
    #[serde(default)]
    pub excluded_objects: Vec<String>,

    /// Excluded object types that may still appear in a plan (guarded).
    #[serde(default)]
    pub opt_in_objects: Vec<String>,

    /// Master selection file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_file: Option<PathBuf>,

    /// Directory for plans, backups and rollback artifacts (default: "migration").
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Object-level concurrency for backup and reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// When a master selection mixes records with and without store-local ids,
    /// also match the unresolved ones by external id instead of planning the
    /// resolved ids only.
    #[serde(default)]
    pub include_unresolved_selections: bool,

    /// Allow reconciliation to fall back to the most recently active user.
    #[serde(default)]
    pub allow_imprecise_actor: bool,

    /// Handling of composite selection values with missing parts.
    #[serde(default)]
    pub composite_partial_policy: PartialValuePolicy,

    /// External id values per reconciliation query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_chunk_size: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            operation: None,
            phase_operations: BTreeMap::new(),
            modified_since: None,
            custom_filters: BTreeMap::new(),
            excluded_objects: Vec::new(),
            opt_in_objects: Vec::new(),
            selection_file: None,
            output_dir: default_output_dir(),
            concurrency: None,
            include_unresolved_selections: false,
            allow_imprecise_actor: false,
            composite_partial_policy: PartialValuePolicy::default(),
            reconcile_chunk_size: None,
        }
    }
}

impl MigrationConfig {
    /// Operation for a phase: phase override, then global, then upsert.
    pub fn operation_for_phase(&self, phase: u32) -> Operation {
        self.phase_operations
            .get(&phase)
            .copied()
            .or(self.operation)
            .unwrap_or_default()
    }

    pub fn is_excluded(&self, object_type: &str) -> bool {
        self.excluded_objects.iter().any(|o| o == object_type)
    }

    pub fn is_opted_in(&self, object_type: &str) -> bool {
        self.opt_in_objects.iter().any(|o| o == object_type)
    }

    pub fn get_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(4)
    }

    pub fn get_reconcile_chunk_size(&self) -> usize {
        self.reconcile_chunk_size.unwrap_or(200)
    }
}

/// Declarative object/phase/relationship graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Object type declarations keyed by type name.
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectDecl>,

    /// Ordered phases.
    #[serde(default)]
    pub phases: Vec<PhaseDecl>,

    /// Parent -> child edges.
    #[serde(default)]
    pub relationships: Vec<RelationshipDecl>,
}

/// Declaration of one object type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectDecl {
    /// External id spec, `;`-separated for composite keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// External id override for specific phases.
    #[serde(default)]
    pub phase_external_ids: BTreeMap<u32, String>,

    /// Business filter applied in every phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Structural filter applied only in the given phase.
    #[serde(default)]
    pub phase_filters: BTreeMap<u32, String>,

    /// Additional fields to select.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Declaration of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDecl {
    pub number: u32,
    #[serde(default)]
    pub description: String,
    pub objects: Vec<String>,
}

/// Declaration of a parent -> child relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDecl {
    pub parent: String,
    pub child: String,
    /// Lookup on the child holding the parent's store-local id.
    pub child_field: String,
    pub phase: u32,
}

fn default_api_version() -> String {
    "59.0".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("migration")
}
