//! Backup engine.
//!
//! Before a run, every planned object's query is re-executed against the
//! target store with the select list widened to every field of the object.
//! All other clauses are kept verbatim so the snapshot covers exactly the
//! records the migration will touch.

pub mod manifest;

pub use manifest::{
    file_stems, manifest_dir, resolve_ref, BackupManifest, BackupObject, OrgDescriptor,
    MANIFEST_FILE,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Operation;
use crate::core::{ExternalIdSpec, MetadataDescriber, RecordStore};
use crate::error::{MigrateError, ObjectWarning, Result};
use crate::plan::{Plan, PlanDocument, PlanObject};
use crate::query::{replace_select_list, split_query};
use crate::tabular;

/// Select-list values that stand for "every field".
const WILDCARDS: &[&str] = &["*", "FIELDS(ALL)"];

/// One object to back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub object_type: String,
    /// Phase the object was planned in, when known.
    pub phase: Option<u32>,
    pub operation: Operation,
    pub external_id: ExternalIdSpec,
    pub query: String,
}

impl From<&PlanObject> for BackupTarget {
    fn from(object: &PlanObject) -> Self {
        Self {
            object_type: object.object_type.clone(),
            phase: None,
            operation: object.operation,
            external_id: object.external_id.clone(),
            query: object.query.clone(),
        }
    }
}

impl BackupTarget {
    /// Targets for every object of an assembled plan.
    pub fn from_plan(plan: &Plan) -> Vec<Self> {
        plan.objects
            .iter()
            .map(|object| Self {
                phase: Some(plan.phase),
                ..Self::from(object)
            })
            .collect()
    }

    /// Targets from a saved plan document written for `phase`.
    pub fn from_document(document: &PlanDocument, phase: Option<u32>) -> Result<Vec<Self>> {
        document
            .objects
            .iter()
            .map(|entry| {
                Ok(Self {
                    object_type: entry.object_type()?,
                    phase,
                    operation: entry.operation,
                    external_id: ExternalIdSpec::parse(&entry.external_id)?,
                    query: entry.query.clone(),
                })
            })
            .collect()
    }
}

/// Field names per object type, fetched once per engine.
#[derive(Default)]
pub struct FieldCache {
    fields: Mutex<HashMap<String, Vec<String>>>,
}

impl FieldCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached fields, describing the object on first use.
    pub async fn get_or_describe(
        &self,
        describer: &dyn MetadataDescriber,
        object_type: &str,
    ) -> Result<Vec<String>> {
        if let Some(fields) = self.fields.lock().await.get(object_type) {
            return Ok(fields.clone());
        }
        let fields = describer.describe_fields(object_type).await?;
        self.fields
            .lock()
            .await
            .insert(object_type.to_string(), fields.clone());
        Ok(fields)
    }

    pub async fn len(&self) -> usize {
        self.fields.lock().await.len()
    }
}

/// Result of a backup run.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub manifest: BackupManifest,
    pub manifest_path: PathBuf,
    pub warnings: Vec<ObjectWarning>,
}

impl BackupOutcome {
    pub fn summary(&self) -> String {
        format!(
            "Backed up {} records across {} objects to {}, completed with {} warnings",
            self.manifest.total_records(),
            self.manifest.objects.len(),
            self.manifest_path.display(),
            self.warnings.len()
        )
    }
}

/// Snapshots target-store records ahead of a migration.
pub struct BackupEngine {
    target: Arc<dyn RecordStore>,
    describer: Arc<dyn MetadataDescriber>,
    cache: FieldCache,
    concurrency: usize,
}

impl BackupEngine {
    pub fn new(target: Arc<dyn RecordStore>, describer: Arc<dyn MetadataDescriber>) -> Self {
        Self {
            target,
            describer,
            cache: FieldCache::new(),
            concurrency: 1,
        }
    }

    /// Number of objects backed up at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Directory for a backup taken now.
    pub fn backup_dir(output_dir: &Path, phase: Option<u32>) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let name = match phase {
            Some(n) => format!("{}_phase{}", stamp, n),
            None => stamp.to_string(),
        };
        output_dir.join("backups").join(name)
    }

    /// Back up every target into `dir` and write the manifest there.
    ///
    /// A failure on one object is recorded as an empty backup with a warning.
    /// The run fails if there was nothing to back up or every object failed;
    /// an object with no matching records counts as backed up.
    pub async fn run(
        &self,
        targets: &[BackupTarget],
        dir: &Path,
        mut manifest: BackupManifest,
    ) -> Result<BackupOutcome> {
        let targets: Vec<&BackupTarget> = targets
            .iter()
            .filter(|t| {
                let known = !t.query.trim().is_empty();
                if !known {
                    warn!("{}: no query recorded, nothing to back up", t.object_type);
                }
                known
            })
            .collect();
        if targets.is_empty() {
            return Err(MigrateError::NothingProcessed(
                "no planned object has a query to back up".to_string(),
            ));
        }

        std::fs::create_dir_all(dir)?;
        info!(
            "Backing up {} objects from {} into {}",
            targets.len(),
            self.target.store_name(),
            dir.display()
        );

        // One snapshot file per entry, even when an object type repeats
        let stems = file_stems(
            &targets
                .iter()
                .map(|t| (t.object_type.as_str(), t.phase))
                .collect::<Vec<_>>(),
        );

        // buffered() yields in input order regardless of completion order
        let results: Vec<(BackupObject, Option<ObjectWarning>)> =
            stream::iter(targets.iter().copied().zip(stems.iter()))
                .map(|(target, stem)| self.backup_object(target, stem, dir))
                .buffered(self.concurrency)
                .collect()
                .await;

        if results.iter().all(|(object, _)| object.error.is_some()) {
            let failures: Vec<String> = results
                .iter()
                .filter_map(|(object, _)| {
                    object
                        .error
                        .as_ref()
                        .map(|e| format!("{}: {}", object.object_type, e))
                })
                .collect();
            return Err(MigrateError::NothingProcessed(format!(
                "every object failed to back up ({})",
                failures.join("; ")
            )));
        }

        let mut warnings = Vec::new();
        for (object, warning) in results {
            manifest.objects.push(object);
            warnings.extend(warning);
        }

        let manifest_path = dir.join(MANIFEST_FILE);
        manifest.save(&manifest_path)?;
        info!(
            "Backup complete: {} records, {} warnings",
            manifest.total_records(),
            warnings.len()
        );

        Ok(BackupOutcome {
            manifest,
            manifest_path,
            warnings,
        })
    }

    async fn backup_object(
        &self,
        target: &BackupTarget,
        stem: &str,
        dir: &Path,
    ) -> (BackupObject, Option<ObjectWarning>) {
        let mut object = BackupObject {
            object_type: target.object_type.clone(),
            phase: target.phase,
            operation: target.operation,
            external_id_spec: target.external_id.clone(),
            backup_file_ref: None,
            record_count: 0,
            field_list: Vec::new(),
            original_query: target.query.clone(),
            post_migration_file_ref: None,
            post_migration_record_count: None,
            error: None,
        };

        match self.snapshot(target, stem, dir, &mut object).await {
            Ok(()) => (object, None),
            Err(e) => {
                warn!("{}: backup failed: {}", target.object_type, e);
                let warning = ObjectWarning::from_error(&target.object_type, &e);
                object.error = Some(e.to_string());
                object.backup_file_ref = None;
                object.record_count = 0;
                (object, Some(warning))
            }
        }
    }

    async fn snapshot(
        &self,
        target: &BackupTarget,
        stem: &str,
        dir: &Path,
        object: &mut BackupObject,
    ) -> Result<()> {
        let fields = self.backup_fields(target).await?;
        let query = replace_select_list(&target.query, &fields)?;
        object.field_list = fields;
        debug!("{}: backup query {}", target.object_type, query);

        let records = self
            .target
            .query_all(&query)
            .await
            .map_err(|e| store_error(&target.object_type, e))?;
        if records.is_empty() {
            info!("{}: no existing records in target", target.object_type);
            return Ok(());
        }

        let file_name = format!("{}.csv", stem);
        let count = tabular::write_records(&dir.join(&file_name), &records, &object.field_list)?;
        object.backup_file_ref = Some(file_name);
        object.record_count = count as u64;
        info!("{}: backed up {} records", target.object_type, count);
        Ok(())
    }

    /// Every describable field, plus the external id paths the plan selected.
    async fn backup_fields(&self, target: &BackupTarget) -> Result<Vec<String>> {
        let parts = split_query(&target.query)?;
        let described = self
            .cache
            .get_or_describe(self.describer.as_ref(), &target.object_type)
            .await;

        let mut fields = match described {
            Ok(fields) if !fields.is_empty() => fields,
            Ok(_) | Err(_) if is_wildcard(&parts.select_list) => {
                return Err(MigrateError::store(
                    &target.object_type,
                    "cannot expand the wildcard select list: describe returned no fields",
                ));
            }
            Ok(_) => split_select_list(&parts.select_list),
            Err(e) => {
                warn!(
                    "{}: describe failed ({}), backing up the planned fields only",
                    target.object_type, e
                );
                split_select_list(&parts.select_list)
            }
        };

        for path in target.external_id.paths() {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(path)) {
                fields.push(path.to_string());
            }
        }
        Ok(fields)
    }
}

fn is_wildcard(select_list: &str) -> bool {
    WILDCARDS
        .iter()
        .any(|w| select_list.trim().eq_ignore_ascii_case(w))
}

fn split_select_list(select_list: &str) -> Vec<String> {
    select_list
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

fn store_error(object_type: &str, err: MigrateError) -> MigrateError {
    match err {
        MigrateError::StoreQuery { .. } => err,
        other => MigrateError::store(object_type, other.to_string()),
    }
}
