//! Rollback planner.
//!
//! Turns a backup manifest into the inverse transfer plan. Objects are
//! reversed so dependents are undone before their parents, and each
//! operation is inverted:
//!
//! | original          | rollback | records from                 |
//! |-------------------|----------|------------------------------|
//! | Insert            | Delete   | post-migration id snapshot   |
//! | Update / Upsert   | Update   | pre-migration snapshot       |
//! | Delete            | Insert   | pre-migration snapshot       |
//! | Readonly          | skipped  |                              |
//!
//! The transfer tool cannot mix file-driven and query-driven objects in one
//! plan, so as soon as one object has a snapshot file every object without
//! one is dropped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::{manifest_dir, resolve_ref, BackupManifest, BackupObject};
use crate::config::Operation;
use crate::error::{MigrateError, Result};
use crate::plan::SkippedObject;
use crate::query::{compose, split_query};
use crate::tabular;

/// Directory, inside the backup directory, holding rollback artifacts.
pub const ROLLBACK_DIR: &str = "rollback";

/// File name of the rollback plan.
pub const ROLLBACK_PLAN_FILE: &str = "rollback_plan.json";

/// Where rollback records come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackMode {
    /// Records are read from snapshot files.
    Snapshot,
    /// Records are re-queried from the live target store.
    Query,
}

/// One object of a rollback plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackEntry {
    pub object_type: String,
    pub original_operation: Operation,
    pub operation: Operation,
    pub query: String,
    pub external_id: String,
    /// Snapshot file inside the rollback directory (snapshot mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_file: Option<String>,
}

/// The inverse transfer plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPlan {
    pub backup_id: String,
    pub mode: RollbackMode,
    /// Org the rollback reads from: the migration's target.
    pub source_org: String,
    /// Org the rollback writes to.
    pub target_org: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Objects in reverse plan order.
    pub objects: Vec<RollbackEntry>,
    #[serde(default)]
    pub skipped: Vec<SkippedObject>,
}

impl RollbackPlan {
    pub fn summary(&self) -> String {
        format!(
            "Rollback plan ({:?} mode): {} objects, {} skipped",
            self.mode,
            self.objects.len(),
            self.skipped.len()
        )
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save the plan (atomic write).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// A written rollback plan.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub plan: RollbackPlan,
    pub plan_path: PathBuf,
}

struct Candidate<'a> {
    object: &'a BackupObject,
    /// File name stem unique to this manifest entry.
    stem: &'a str,
    operation: Operation,
    file: Option<PathBuf>,
}

/// Build the rollback plan for the manifest at `manifest_path` and write it,
/// with repaired snapshot copies, under `<manifest dir>/rollback/`.
pub fn plan_rollback(manifest_path: &Path) -> Result<RollbackOutcome> {
    let manifest = BackupManifest::load(manifest_path)?;
    let dir = manifest_dir(manifest_path);
    let out_dir = dir.join(ROLLBACK_DIR);

    let mut skipped = Vec::new();
    let mut candidates = Vec::new();
    let stems = manifest.file_stems();
    for (object, stem) in manifest.objects.iter().zip(stems.iter()).rev() {
        match candidate(object, stem, &dir) {
            Ok(candidate) => candidates.push(candidate),
            Err(reason) => {
                warn!("{}: left out of rollback: {}", object.object_type, reason);
                skipped.push(SkippedObject::new(&object.object_type, reason));
            }
        }
    }

    let mode = if candidates.iter().any(|c| c.file.is_some()) {
        RollbackMode::Snapshot
    } else {
        RollbackMode::Query
    };

    std::fs::create_dir_all(&out_dir)?;
    let mut objects = Vec::new();
    for candidate in candidates {
        let object = candidate.object;
        let entry = match (mode, &candidate.file) {
            (RollbackMode::Snapshot, Some(src)) => {
                let file_name = format!("{}.csv", candidate.stem);
                let report = tabular::repair_copy(src, &out_dir.join(&file_name))?;
                if report.changed() {
                    info!(
                        "{}: repaired snapshot ({} padded, {} truncated rows, BOM stripped: {})",
                        object.object_type,
                        report.padded_rows,
                        report.truncated_rows,
                        report.bom_stripped
                    );
                }
                let headers = tabular::read_table(&out_dir.join(&file_name))?.headers;
                RollbackEntry {
                    object_type: object.object_type.clone(),
                    original_operation: object.operation,
                    operation: candidate.operation,
                    query: compose(&headers.join(", "), &object.object_type, ""),
                    external_id: object.external_id_spec.to_string(),
                    snapshot_file: Some(file_name),
                }
            }
            (RollbackMode::Snapshot, None) => {
                let reason = "no snapshot file while the rollback is snapshot-driven";
                warn!("{}: left out of rollback: {}", object.object_type, reason);
                skipped.push(SkippedObject::new(&object.object_type, reason));
                continue;
            }
            (RollbackMode::Query, _) => {
                split_query(&object.original_query)?;
                RollbackEntry {
                    object_type: object.object_type.clone(),
                    original_operation: object.operation,
                    operation: candidate.operation,
                    query: object.original_query.clone(),
                    external_id: object.external_id_spec.to_string(),
                    snapshot_file: None,
                }
            }
        };
        objects.push(entry);
    }

    if objects.is_empty() {
        return Err(MigrateError::NothingProcessed(format!(
            "no object in {} can be rolled back",
            manifest_path.display()
        )));
    }

    let plan = RollbackPlan {
        backup_id: manifest.backup_id.clone(),
        mode,
        source_org: manifest.target.alias.clone(),
        target_org: manifest.target.alias.clone(),
        api_version: manifest.target.api_version.clone(),
        objects,
        skipped,
    };
    let plan_path = out_dir.join(ROLLBACK_PLAN_FILE);
    plan.save(&plan_path)?;
    info!("{} written to {}", plan.summary(), plan_path.display());

    Ok(RollbackOutcome { plan, plan_path })
}

/// Inverse operation and record source for one object, or why it cannot be
/// rolled back.
fn candidate<'a>(
    object: &'a BackupObject,
    stem: &'a str,
    dir: &Path,
) -> std::result::Result<Candidate<'a>, String> {
    let existing = |file_ref: &Option<String>| {
        file_ref
            .as_deref()
            .map(|r| resolve_ref(dir, r))
            .filter(|p| p.exists())
    };

    match object.operation {
        Operation::Readonly => Err("read-only objects have nothing to roll back".to_string()),
        Operation::Insert => match existing(&object.post_migration_file_ref) {
            Some(file) => Ok(Candidate {
                object,
                stem,
                operation: Operation::Delete,
                file: Some(file),
            }),
            None => Err(
                "no post-migration id snapshot; created records cannot be deleted safely"
                    .to_string(),
            ),
        },
        Operation::Update | Operation::Upsert => Ok(Candidate {
            object,
            stem,
            operation: Operation::Update,
            file: existing(&object.backup_file_ref),
        }),
        Operation::Delete => Ok(Candidate {
            object,
            stem,
            operation: Operation::Insert,
            file: existing(&object.backup_file_ref),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{OrgDescriptor, MANIFEST_FILE};
    use crate::core::ExternalIdSpec;
    use tempfile::tempdir;

    fn object(object_type: &str, operation: Operation) -> BackupObject {
        BackupObject {
            object_type: object_type.into(),
            phase: None,
            operation,
            external_id_spec: ExternalIdSpec::parse("Name").unwrap(),
            backup_file_ref: None,
            record_count: 0,
            field_list: vec!["Id".into(), "Name".into()],
            original_query: format!("SELECT Id, Name FROM {}", object_type),
            post_migration_file_ref: None,
            post_migration_record_count: None,
            error: None,
        }
    }

    fn write_manifest(dir: &Path, objects: Vec<BackupObject>) -> PathBuf {
        let mut manifest = BackupManifest::new(
            Some(1),
            OrgDescriptor {
                alias: "dev".into(),
                ..Default::default()
            },
            OrgDescriptor {
                alias: "prod".into(),
                api_version: "59.0".into(),
                ..Default::default()
            },
        );
        manifest.objects = objects;
        let path = dir.join(MANIFEST_FILE);
        manifest.save(&path).unwrap();
        path
    }

    #[test]
    fn test_query_mode_reverses_order() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            vec![
                object("A", Operation::Upsert),
                object("B", Operation::Update),
                object("C", Operation::Delete),
            ],
        );
        let outcome = plan_rollback(&path).unwrap();
        let plan = outcome.plan;
        assert_eq!(plan.mode, RollbackMode::Query);
        let order: Vec<&str> = plan.objects.iter().map(|o| o.object_type.as_str()).collect();
        assert_eq!(order, vec!["C", "B", "A"]);
        assert_eq!(plan.objects[0].operation, Operation::Insert);
        assert_eq!(plan.objects[2].operation, Operation::Update);
        assert_eq!(plan.source_org, "prod");
        assert!(outcome.plan_path.ends_with("rollback/rollback_plan.json"));
    }

    #[test]
    fn test_readonly_skipped_with_reason() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            vec![object("A", Operation::Upsert), object("L", Operation::Readonly)],
        );
        let plan = plan_rollback(&path).unwrap().plan;
        assert_eq!(plan.objects.len(), 1);
        assert_eq!(plan.skipped[0].object_type, "L");
    }

    #[test]
    fn test_snapshot_mode_drops_objects_without_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.csv"), "\u{feff}Id,Name\nt1,A1\n").unwrap();
        let mut a = object("A", Operation::Upsert);
        a.backup_file_ref = Some("A.csv".into());
        a.record_count = 1;
        let path = write_manifest(dir.path(), vec![a, object("B", Operation::Upsert)]);

        let plan = plan_rollback(&path).unwrap().plan;
        assert_eq!(plan.mode, RollbackMode::Snapshot);
        assert_eq!(plan.objects.len(), 1);
        assert_eq!(plan.objects[0].snapshot_file.as_deref(), Some("A.csv"));
        assert_eq!(plan.objects[0].query, "SELECT Id, Name FROM A");
        assert!(plan.skipped.iter().any(|s| s.object_type == "B"));

        let copied = std::fs::read_to_string(dir.path().join("rollback").join("A.csv")).unwrap();
        assert_eq!(copied, "Id,Name\nt1,A1\n");
    }

    #[test]
    fn test_unreconciled_insert_skipped_beside_snapshot_object() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("A.csv"), "Id,Name\nt1,A1\n").unwrap();
        let mut a = object("A", Operation::Upsert);
        a.backup_file_ref = Some("A.csv".into());
        let path = write_manifest(dir.path(), vec![a, object("N", Operation::Insert)]);

        let plan = plan_rollback(&path).unwrap().plan;
        assert_eq!(plan.mode, RollbackMode::Snapshot);
        assert_eq!(plan.objects.len(), 1);
        assert_eq!(plan.objects[0].object_type, "A");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].object_type, "N");
        assert!(plan.skipped[0]
            .reason
            .contains("no post-migration id snapshot"));
        assert!(!dir.path().join("rollback").join("N.csv").exists());
    }

    #[test]
    fn test_unreconciled_insert_never_becomes_query_delete() {
        let dir = tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            vec![object("A", Operation::Upsert), object("N", Operation::Insert)],
        );

        let plan = plan_rollback(&path).unwrap().plan;
        assert_eq!(plan.mode, RollbackMode::Query);
        assert!(plan
            .objects
            .iter()
            .all(|o| o.object_type != "N" && o.operation != Operation::Delete));
        assert_eq!(plan.objects[0].operation, Operation::Update);
        assert_eq!(plan.skipped[0].object_type, "N");
    }

    #[test]
    fn test_repeated_object_type_keeps_separate_snapshots() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Q_phase1.csv"), "Id,Name\nq1,One\n").unwrap();
        std::fs::write(
            dir.path().join("Q_phase2.csv"),
            "Id,Name\nq2,Two\nq3,Three\n",
        )
        .unwrap();
        let mut first = object("Q", Operation::Upsert);
        first.phase = Some(1);
        first.backup_file_ref = Some("Q_phase1.csv".into());
        let mut second = object("Q", Operation::Upsert);
        second.phase = Some(2);
        second.backup_file_ref = Some("Q_phase2.csv".into());
        let path = write_manifest(dir.path(), vec![first, second]);

        let plan = plan_rollback(&path).unwrap().plan;
        let files: Vec<_> = plan
            .objects
            .iter()
            .map(|o| o.snapshot_file.as_deref().unwrap())
            .collect();
        assert_eq!(files, vec!["Q_phase2.csv", "Q_phase1.csv"]);

        let rollback = dir.path().join("rollback");
        let rows = |name: &str| tabular::read_table(&rollback.join(name)).unwrap().rows.len();
        assert_eq!(rows("Q_phase1.csv"), 1);
        assert_eq!(rows("Q_phase2.csv"), 2);
    }

    #[test]
    fn test_nothing_to_roll_back() {
        let dir = tempdir().unwrap();
        let path = write_manifest(dir.path(), vec![object("A", Operation::Insert)]);
        let err = plan_rollback(&path).unwrap_err();
        assert_eq!(err.kind(), "nothing_processed");
    }
}
