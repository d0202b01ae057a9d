//! Plan assembler and transfer-plan documents.
//!
//! Walks the phase graph for a requested scope and produces, per phase, the
//! ordered list of objects the transfer tool should move. Objects are kept in
//! the phase's declared order; rollback reversal relies on it.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, MigrationConfig, Operation, OrgConfig};
use crate::core::ExternalIdSpec;
use crate::error::{MigrateError, Result};
use crate::graph::{ObjectRole, PhaseGraph};
use crate::query::{split_query, QueryBuilder};
use crate::selection::SelectionSet;

/// Which phases to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanScope {
    Phase(u32),
    All,
}

/// One object in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanObject {
    pub object_type: String,
    pub query: String,
    pub operation: Operation,
    pub external_id: ExternalIdSpec,
    pub is_slave: bool,
}

/// An object left out of a plan and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedObject {
    pub object_type: String,
    pub reason: String,
}

impl SkippedObject {
    pub fn new(object_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            reason: reason.into(),
        }
    }
}

/// Connection descriptors carried in plan documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgPair {
    pub source: Option<String>,
    pub target: Option<String>,
    pub api_version: Option<String>,
}

impl OrgPair {
    pub fn from_orgs(source: &OrgConfig, target: &OrgConfig) -> Self {
        Self {
            source: Some(source.alias.clone()),
            target: Some(target.alias.clone()),
            api_version: Some(target.api_version.clone()),
        }
    }
}

/// The plan for one phase.
#[derive(Debug, Clone)]
pub struct Plan {
    pub phase: u32,
    pub objects: Vec<PlanObject>,
    pub excluded_objects: Vec<String>,
    pub orgs: OrgPair,
    /// Objects dropped while planning (not part of the document).
    pub skipped: Vec<SkippedObject>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, object_type: &str) -> Option<&PlanObject> {
        self.objects.iter().find(|o| o.object_type == object_type)
    }

    /// Document handed to the transfer tool.
    pub fn to_document(&self) -> PlanDocument {
        PlanDocument {
            objects: self
                .objects
                .iter()
                .map(|o| PlanEntry {
                    query: o.query.clone(),
                    operation: o.operation,
                    external_id: o.external_id.to_string(),
                    master: o.is_slave.then_some(false),
                })
                .collect(),
            excluded_objects: self.excluded_objects.clone(),
            source_org: self.orgs.source.clone(),
            target_org: self.orgs.target.clone(),
            api_version: self.orgs.api_version.clone(),
        }
    }
}

/// Builds phase plans from the graph, the selections and the migration settings.
pub struct PlanAssembler<'a> {
    graph: &'a PhaseGraph,
    migration: &'a MigrationConfig,
    selections: &'a SelectionSet,
    orgs: OrgPair,
}

impl<'a> PlanAssembler<'a> {
    pub fn new(
        graph: &'a PhaseGraph,
        migration: &'a MigrationConfig,
        selections: &'a SelectionSet,
    ) -> Self {
        Self {
            graph,
            migration,
            selections,
            orgs: OrgPair::default(),
        }
    }

    /// Assembler over a loaded configuration.
    pub fn for_config(
        config: &'a Config,
        graph: &'a PhaseGraph,
        selections: &'a SelectionSet,
    ) -> Self {
        Self::new(graph, &config.migration, selections)
            .with_orgs(OrgPair::from_orgs(&config.source, &config.target))
    }

    pub fn with_orgs(mut self, orgs: OrgPair) -> Self {
        self.orgs = orgs;
        self
    }

    /// Assemble plans for the scope, one per phase, in phase order.
    pub fn assemble(&self, scope: PlanScope) -> Result<Vec<Plan>> {
        let last = match scope {
            PlanScope::Phase(n) => {
                if self.graph.phase(n).is_none() {
                    return Err(MigrateError::Config(format!("Unknown phase {}", n)));
                }
                n
            }
            PlanScope::All => self.graph.phases().len() as u32,
        };

        // Earlier phases are walked even for a single-phase scope: a slave's
        // parent may have been included in an earlier phase.
        let mut included: HashSet<String> = HashSet::new();
        let mut plans = Vec::new();
        for number in 1..=last {
            let plan = self.assemble_phase(number, &mut included)?;
            if scope == PlanScope::All || number == last {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// Assemble a single phase.
    pub fn assemble_one(&self, phase: u32) -> Result<Plan> {
        self.assemble(PlanScope::Phase(phase))?
            .pop()
            .ok_or_else(|| MigrateError::Config(format!("Unknown phase {}", phase)))
    }

    fn assemble_phase(&self, number: u32, included: &mut HashSet<String>) -> Result<Plan> {
        let phase = self
            .graph
            .phase(number)
            .ok_or_else(|| MigrateError::Config(format!("Unknown phase {}", number)))?;
        let builder = QueryBuilder::new(self.graph, self.migration, self.selections);
        let operation = self.migration.operation_for_phase(number);

        let mut objects = Vec::new();
        let mut skipped = Vec::new();
        for entry in &phase.entries {
            let object_type = entry.object_type.as_str();

            if self.migration.is_excluded(object_type) && !self.migration.is_opted_in(object_type) {
                debug!(phase = number, "{}: on the exclusion list", object_type);
                skipped.push(SkippedObject::new(object_type, "excluded"));
                continue;
            }

            let Some(spec) = self.graph.external_id(object_type, Some(number)) else {
                warn!(phase = number, "{}: no external id configured, skipping", object_type);
                skipped.push(SkippedObject::new(object_type, "no external id configured"));
                continue;
            };

            match &entry.role {
                ObjectRole::Master => {
                    if self.selections.is_empty_for(object_type) {
                        debug!(phase = number, "{}: no records selected", object_type);
                        skipped.push(SkippedObject::new(object_type, "no records selected"));
                        continue;
                    }
                }
                ObjectRole::Slave { parents } => {
                    if !parents.iter().any(|p| included.contains(&p.parent)) {
                        debug!(phase = number, "{}: no parent is part of the migration", object_type);
                        skipped.push(SkippedObject::new(
                            object_type,
                            "no parent is part of the migration",
                        ));
                        continue;
                    }
                }
            }

            let built = builder.build(object_type, Some(number), spec, &entry.role);
            if built.deferred {
                info!(
                    phase = number,
                    "{}: parent ids not yet known, records follow the parent at transfer time",
                    object_type
                );
            }
            included.insert(object_type.to_string());
            objects.push(PlanObject {
                object_type: object_type.to_string(),
                query: built.query,
                operation,
                external_id: spec.clone(),
                is_slave: entry.role.is_slave(),
            });
        }

        info!(
            phase = number,
            "Planned {} objects ({} skipped)",
            objects.len(),
            skipped.len()
        );

        Ok(Plan {
            phase: number,
            objects,
            excluded_objects: self.migration.excluded_objects.clone(),
            orgs: self.orgs.clone(),
            skipped,
        })
    }
}

/// One entry of a plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub query: String,
    pub operation: Operation,
    pub external_id: String,
    /// `Some(false)` marks a dependent object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<bool>,
}

impl PlanEntry {
    /// Object type queried by this entry.
    pub fn object_type(&self) -> Result<String> {
        Ok(split_query(&self.query)?.object_type)
    }

    pub fn is_slave(&self) -> bool {
        self.master == Some(false)
    }
}

/// Plan document consumed by the transfer tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    pub objects: Vec<PlanEntry>,
    #[serde(default)]
    pub excluded_objects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl PlanDocument {
    /// Load a plan document from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("Cannot read plan {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the document (atomic write).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}
