//! Backup manifest persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{Operation, OrgConfig};
use crate::core::ExternalIdSpec;
use crate::error::{MigrateError, Result};

/// File name of the manifest inside a backup directory.
pub const MANIFEST_FILE: &str = "backup_manifest.json";

/// Organization a backup was taken against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgDescriptor {
    pub alias: String,
    #[serde(default)]
    pub instance_url: String,
    #[serde(default)]
    pub api_version: String,
}

impl From<&OrgConfig> for OrgDescriptor {
    fn from(org: &OrgConfig) -> Self {
        Self {
            alias: org.alias.clone(),
            instance_url: org.instance_url.clone(),
            api_version: org.api_version.clone(),
        }
    }
}

/// Backup of one planned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupObject {
    pub object_type: String,
    /// Phase the object was planned in, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    pub operation: Operation,
    pub external_id_spec: ExternalIdSpec,

    /// Snapshot file name, relative to the manifest directory. `None` when
    /// nothing was backed up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file_ref: Option<String>,

    pub record_count: u64,
    pub field_list: Vec<String>,
    pub original_query: String,

    /// Ids created by the migration, written by reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_migration_file_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_migration_record_count: Option<u64>,

    /// Why the backup of this object failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackupObject {
    pub fn has_snapshot(&self) -> bool {
        self.backup_file_ref.is_some()
    }

    pub fn is_reconciled(&self) -> bool {
        self.post_migration_file_ref.is_some()
    }
}

/// Manifest written next to the snapshot files of one backup run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_number: Option<u32>,
    pub source: OrgDescriptor,
    pub target: OrgDescriptor,

    /// Objects in plan order.
    pub objects: Vec<BackupObject>,

    /// SHA-256 over the manifest without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BackupManifest {
    pub fn new(phase_number: Option<u32>, source: OrgDescriptor, target: OrgDescriptor) -> Self {
        Self {
            backup_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            phase_number,
            source,
            target,
            objects: Vec::new(),
            digest: None,
        }
    }

    pub fn object(&self, object_type: &str) -> Option<&BackupObject> {
        self.objects.iter().find(|o| o.object_type == object_type)
    }

    /// File name stem of every entry's snapshot and created-id files, in
    /// entry order.
    pub fn file_stems(&self) -> Vec<String> {
        file_stems(
            &self
                .objects
                .iter()
                .map(|o| (o.object_type.as_str(), o.phase))
                .collect::<Vec<_>>(),
        )
    }

    /// Total records backed up.
    pub fn total_records(&self) -> u64 {
        self.objects.iter().map(|o| o.record_count).sum()
    }

    fn compute_digest(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.digest = None;
        let content = serde_json::to_string(&unsigned)?;
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Load a manifest, verifying its digest when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("Cannot read manifest {}: {}", path.display(), e))
        })?;
        let manifest: Self = serde_json::from_str(&content)?;

        match &manifest.digest {
            Some(stored) => {
                if *stored != manifest.compute_digest()? {
                    return Err(MigrateError::Config(format!(
                        "Manifest {} failed its integrity check (digest mismatch)",
                        path.display()
                    )));
                }
            }
            None => {
                tracing::warn!(
                    "Manifest {} has no digest, integrity cannot be verified",
                    path.display()
                );
            }
        }
        Ok(manifest)
    }

    /// Save the manifest (atomic write with digest).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.digest = Some(self.compute_digest()?);
        let content = serde_json::to_string_pretty(self)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Unique file name stems for manifest entries keyed by object type and phase.
///
/// An object type that appears once keeps its plain name. A repeated type is
/// suffixed with its phase (`Query_phase2`), or with its occurrence number
/// (`Query_2`) when the phase does not tell the entries apart.
pub fn file_stems(entries: &[(&str, Option<u32>)]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    entries
        .iter()
        .map(|&(object_type, phase)| {
            let occurrence = seen.entry(object_type).or_insert(0);
            *occurrence += 1;

            let same_type = entries.iter().filter(|(t, _)| *t == object_type).count();
            if same_type == 1 {
                return object_type.to_string();
            }
            match phase {
                Some(n)
                    if entries
                        .iter()
                        .filter(|&&(t, p)| t == object_type && p == Some(n))
                        .count()
                        == 1 =>
                {
                    format!("{}_phase{}", object_type, n)
                }
                _ => format!("{}_{}", object_type, occurrence),
            }
        })
        .collect()
}

/// Resolve a file reference relative to the manifest directory.
pub fn resolve_ref(manifest_dir: &Path, file_ref: &str) -> PathBuf {
    manifest_dir.join(file_ref)
}

/// Directory holding a manifest file.
pub fn manifest_dir(manifest_path: &Path) -> PathBuf {
    manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest() -> BackupManifest {
        let mut manifest = BackupManifest::new(
            Some(1),
            OrgDescriptor {
                alias: "dev".into(),
                ..Default::default()
            },
            OrgDescriptor {
                alias: "prod".into(),
                ..Default::default()
            },
        );
        manifest.objects.push(BackupObject {
            object_type: "Rule".into(),
            phase: Some(1),
            operation: Operation::Upsert,
            external_id_spec: ExternalIdSpec::parse("Name").unwrap(),
            backup_file_ref: Some("Rule.csv".into()),
            record_count: 2,
            field_list: vec!["Id".into(), "Name".into()],
            original_query: "SELECT Id, Name FROM Rule".into(),
            post_migration_file_ref: None,
            post_migration_record_count: None,
            error: None,
        });
        manifest
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let mut manifest = manifest();
        manifest.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"externalIdSpec\": \"Name\""));
        assert!(content.contains("\"phaseNumber\": 1"));
        assert!(!content.contains("postMigrationFileRef"));

        let loaded = BackupManifest::load(&path).unwrap();
        assert_eq!(loaded.objects, manifest.objects);
        assert_eq!(loaded.total_records(), 2);
    }

    #[test]
    fn test_file_stems_unique_per_entry() {
        let stems = file_stems(&[
            ("Rule", Some(1)),
            ("Query", Some(1)),
            ("Query", Some(2)),
            ("Line", Some(2)),
            ("Line", Some(2)),
            ("Line", None),
        ]);
        assert_eq!(
            stems,
            vec!["Rule", "Query_phase1", "Query_phase2", "Line_1", "Line_2", "Line_3"]
        );
    }

    #[test]
    fn test_tampered_manifest_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        manifest().save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("\"recordCount\": 2", "\"recordCount\": 9")).unwrap();
        let err = BackupManifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("integrity"));
    }

    #[test]
    fn test_manifest_without_digest_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let manifest = manifest();
        std::fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();
        assert!(BackupManifest::load(&path).is_ok());
    }
}
