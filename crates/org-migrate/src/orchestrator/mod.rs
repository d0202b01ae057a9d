//! Migration orchestrator - workflow coordinator used by the CLI.
//!
//! Ties configuration, selections and stores together for the four
//! operator steps: plan, backup, reconcile and rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::{BackupEngine, BackupManifest, BackupOutcome, BackupTarget, OrgDescriptor};
use crate::config::Config;
use crate::core::{ExternalIdSpec, MetadataDescriber, RecordStore};
use crate::drivers::RestStore;
use crate::error::{MigrateError, ObjectWarning, Result};
use crate::graph::PhaseGraph;
use crate::plan::{PlanAssembler, PlanDocument, PlanScope, SkippedObject};
use crate::reconcile::{ReconcileOutcome, Reconciler, RunWindow};
use crate::rollback::{plan_rollback, RollbackOutcome};
use crate::selection::SelectionSet;

/// Store collaborators for one source/target pair.
#[derive(Clone)]
pub struct Stores {
    pub source: Arc<dyn RecordStore>,
    pub target: Arc<dyn RecordStore>,
    /// Describes target objects for backups.
    pub describer: Arc<dyn MetadataDescriber>,
}

impl Stores {
    /// REST stores for the configured organizations.
    pub fn connect(config: &Config) -> Result<Self> {
        let source = Arc::new(RestStore::from_config(&config.source)?);
        let target = Arc::new(RestStore::from_config(&config.target)?);
        Ok(Self {
            source,
            target: target.clone(),
            describer: target,
        })
    }
}

/// A plan document written for one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub phase: u32,
    pub path: PathBuf,
    pub objects: Vec<String>,
    pub skipped: Vec<SkippedObject>,
}

/// Result of selection resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveReport {
    pub path: PathBuf,
    pub objects: Vec<String>,
    pub warnings: Vec<ObjectWarning>,
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    graph: PhaseGraph,
    stores: Option<Stores>,
}

impl Orchestrator {
    /// Create a new orchestrator. No store is contacted.
    pub fn new(config: Config) -> Result<Self> {
        let graph = config.graph()?;
        Ok(Self {
            config,
            graph,
            stores: None,
        })
    }

    /// Use the given stores instead of connecting to the configured ones.
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Connect to the configured organizations.
    pub fn connect(self) -> Result<Self> {
        let stores = Stores::connect(&self.config)?;
        Ok(self.with_stores(stores))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn graph(&self) -> &PhaseGraph {
        &self.graph
    }

    fn stores(&self) -> Result<&Stores> {
        self.stores
            .as_ref()
            .ok_or_else(|| MigrateError::Config("no store connection configured".to_string()))
    }

    fn output_dir(&self) -> &Path {
        &self.config.migration.output_dir
    }

    /// Path of the plan document for a phase.
    pub fn plan_path(&self, phase: u32) -> PathBuf {
        self.output_dir()
            .join("plans")
            .join(format!("phase_{}.json", phase))
    }

    /// Load the configured selection file; no file means nothing is selected.
    pub fn load_selections(&self) -> Result<SelectionSet> {
        match &self.config.migration.selection_file {
            Some(path) if path.exists() => SelectionSet::load(path),
            Some(path) => {
                warn!(
                    "Selection file {} does not exist, no master records are selected",
                    path.display()
                );
                Ok(SelectionSet::new())
            }
            None => Ok(SelectionSet::new()),
        }
    }

    /// Assemble and write plan documents for the scope.
    pub fn plan(&self, scope: PlanScope) -> Result<Vec<PlannedPhase>> {
        let selections = self.load_selections()?;
        let plans =
            PlanAssembler::for_config(&self.config, &self.graph, &selections).assemble(scope)?;

        let mut written = Vec::new();
        for plan in plans {
            let path = self.plan_path(plan.phase);
            plan.to_document().save(&path)?;
            info!(
                phase = plan.phase,
                "Wrote plan with {} objects to {}",
                plan.objects.len(),
                path.display()
            );
            written.push(PlannedPhase {
                phase: plan.phase,
                path,
                objects: plan.objects.iter().map(|o| o.object_type.clone()).collect(),
                skipped: plan.skipped,
            });
        }
        Ok(written)
    }

    /// Look up missing store-local ids of selected master records on the source.
    pub async fn resolve_selection(&self) -> Result<ResolveReport> {
        let path = self.config.migration.selection_file.clone().ok_or_else(|| {
            MigrateError::Config("migration.selection_file is not set".to_string())
        })?;
        let mut selections = SelectionSet::load(&path)?;
        let stores = self.stores()?;

        let object_types: Vec<String> = selections.object_types().map(str::to_string).collect();
        let mut warnings = Vec::new();
        for object_type in &object_types {
            let Some(spec) = self.master_external_id(object_type) else {
                warnings.push(ObjectWarning::new(
                    object_type,
                    "configuration",
                    "not a master object with an external id",
                ));
                continue;
            };
            let result = selections
                .resolve_store_ids(
                    object_type,
                    &spec,
                    stores.source.as_ref(),
                    self.config.migration.get_reconcile_chunk_size(),
                    self.config.migration.composite_partial_policy,
                )
                .await;
            match result {
                Ok(mut object_warnings) => warnings.append(&mut object_warnings),
                Err(e) => {
                    warn!("{}: selection lookup failed: {}", object_type, e);
                    warnings.push(ObjectWarning::from_error(object_type, &e));
                }
            }
        }

        selections.save(&path)?;
        Ok(ResolveReport {
            path,
            objects: object_types,
            warnings,
        })
    }

    /// External id of an object in the first phase it is a master in.
    fn master_external_id(&self, object_type: &str) -> Option<ExternalIdSpec> {
        self.graph
            .phases()
            .iter()
            .find(|p| {
                p.entry(object_type)
                    .map(|e| !e.role.is_slave())
                    .unwrap_or(false)
            })
            .and_then(|p| self.graph.external_id(object_type, Some(p.number)))
            .cloned()
    }

    /// Snapshot the target records a phase (or every phase) will touch.
    ///
    /// Objects come from `plan_file` when given, otherwise from a freshly
    /// assembled plan.
    pub async fn backup(&self, phase: Option<u32>, plan_file: Option<&Path>) -> Result<BackupOutcome> {
        let stores = self.stores()?;
        let targets = match plan_file {
            Some(path) => BackupTarget::from_document(&PlanDocument::load(path)?, phase)?,
            None => {
                let selections = self.load_selections()?;
                let scope = phase.map(PlanScope::Phase).unwrap_or(PlanScope::All);
                PlanAssembler::for_config(&self.config, &self.graph, &selections)
                    .assemble(scope)?
                    .iter()
                    .flat_map(BackupTarget::from_plan)
                    .collect()
            }
        };

        let dir = BackupEngine::backup_dir(self.output_dir(), phase);
        let manifest = BackupManifest::new(
            phase,
            OrgDescriptor::from(&self.config.source),
            OrgDescriptor::from(&self.config.target),
        );

        BackupEngine::new(stores.target.clone(), stores.describer.clone())
            .with_concurrency(self.config.migration.get_concurrency())
            .run(&targets, &dir, manifest)
            .await
    }

    /// Identify records created by a completed run.
    pub async fn reconcile(
        &self,
        manifest_path: &Path,
        window: Option<RunWindow>,
    ) -> Result<ReconcileOutcome> {
        let stores = self.stores()?;
        let window = window.map(|mut w| {
            if w.username.is_none() {
                w.username = self.config.target.username.clone();
            }
            w
        });
        Reconciler::new(stores.source.clone(), stores.target.clone())
            .with_chunk_size(self.config.migration.get_reconcile_chunk_size())
            .with_concurrency(self.config.migration.get_concurrency())
            .allow_imprecise_actor(self.config.migration.allow_imprecise_actor)
            .with_partial_policy(self.config.migration.composite_partial_policy)
            .run(manifest_path, window.as_ref())
            .await
    }

    /// Write the rollback plan for a backup.
    pub fn rollback(&self, manifest_path: &Path) -> Result<RollbackOutcome> {
        plan_rollback(manifest_path)
    }
}
