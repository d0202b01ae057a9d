//! Master record selections.
//!
//! A selection lists, per master object type, the records chosen to migrate:
//! their external id value and, once known, their source store-local id.
//! An object type with no entries is excluded from planning entirely.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PartialValuePolicy;
use crate::core::record::record_id;
use crate::core::{ExternalIdSpec, RecordStore, ID_FIELD};
use crate::error::{ObjectWarning, Result};
use crate::query::{external_id_filter, select_fields};

/// One selected master record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedRecord {
    pub external_id_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_local_id: Option<String>,
}

impl SelectedRecord {
    pub fn new(external_id_value: impl Into<String>, store_local_id: Option<&str>) -> Self {
        Self {
            external_id_value: external_id_value.into(),
            store_local_id: store_local_id.map(str::to_string),
        }
    }
}

/// Selections keyed by master object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionSet {
    objects: BTreeMap<String, Vec<SelectedRecord>>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load selections from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save selections (atomic write).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Replace the selection for an object type.
    pub fn set(&mut self, object_type: &str, records: Vec<SelectedRecord>) {
        self.objects.insert(object_type.to_string(), records);
    }

    pub fn records(&self, object_type: &str) -> &[SelectedRecord] {
        self.objects
            .get(object_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// True if nothing is selected for the object type.
    pub fn is_empty_for(&self, object_type: &str) -> bool {
        self.records(object_type).is_empty()
    }

    /// Known store-local ids, in selection order, without duplicates.
    pub fn store_ids(&self, object_type: &str) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for id in self
            .records(object_type)
            .iter()
            .filter_map(|r| r.store_local_id.as_deref())
            .filter(|id| !id.is_empty())
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// External id values of records that have no store-local id yet.
    pub fn unresolved_values(&self, object_type: &str) -> Vec<&str> {
        self.records(object_type)
            .iter()
            .filter(|r| r.store_local_id.as_deref().map_or(true, str::is_empty))
            .map(|r| r.external_id_value.as_str())
            .collect()
    }

    pub fn object_types(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Fill in missing store-local ids by looking selected external id values up
    /// in the source store.
    ///
    /// A value is resolved only when exactly one source record matches; other
    /// outcomes are reported as warnings and leave the entry untouched.
    pub async fn resolve_store_ids(
        &mut self,
        object_type: &str,
        spec: &ExternalIdSpec,
        source: &dyn RecordStore,
        chunk_size: usize,
        policy: PartialValuePolicy,
    ) -> Result<Vec<ObjectWarning>> {
        let pending: Vec<String> = self
            .unresolved_values(object_type)
            .into_iter()
            .map(str::to_string)
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let fields = select_fields(spec, &[]);
        let mut matches: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for chunk in pending.chunks(chunk_size.max(1)) {
            let Some(filter) = external_id_filter(object_type, spec, chunk, policy) else {
                continue;
            };
            let query = format!(
                "SELECT {} FROM {} WHERE {}",
                fields.join(", "),
                object_type,
                filter
            );
            for record in source.query_all(&query).await? {
                if let (Some(value), Some(id)) = (spec.value_of(&record), record_id(&record)) {
                    matches.entry(value).or_default().push(id);
                }
            }
        }

        let mut warnings = Vec::new();
        let mut resolved = 0;
        if let Some(records) = self.objects.get_mut(object_type) {
            for record in records
                .iter_mut()
                .filter(|r| r.store_local_id.as_deref().map_or(true, str::is_empty))
            {
                match matches.get(&record.external_id_value).map(Vec::as_slice) {
                    Some([id]) => {
                        record.store_local_id = Some(id.clone());
                        resolved += 1;
                    }
                    Some(ids) => warnings.push(ObjectWarning::new(
                        object_type,
                        "ambiguous_identity",
                        format!(
                            "{} matches {} source records by {}",
                            record.external_id_value,
                            ids.len(),
                            spec
                        ),
                    )),
                    None => warnings.push(ObjectWarning::new(
                        object_type,
                        "not_found",
                        format!(
                            "{} not found in source by {} (no {})",
                            record.external_id_value, spec, ID_FIELD
                        ),
                    )),
                }
            }
        }

        info!(
            "{}: resolved {} of {} selected records",
            object_type,
            resolved,
            pending.len()
        );
        for warning in &warnings {
            warn!("{}: {}", warning.object_type, warning.message);
        }
        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_store_ids_and_unresolved() {
        let mut selection = SelectionSet::new();
        selection.set(
            "Rule",
            vec![
                SelectedRecord::new("R1", Some("s1")),
                SelectedRecord::new("R2", None),
                SelectedRecord::new("R3", Some("s1")),
            ],
        );
        assert_eq!(selection.store_ids("Rule"), vec!["s1"]);
        assert_eq!(selection.unresolved_values("Rule"), vec!["R2"]);
        assert!(selection.is_empty_for("Other"));
    }

    #[test]
    fn test_json_shape_and_round_trip() {
        let mut selection = SelectionSet::new();
        selection.set("Rule", vec![SelectedRecord::new("R1", Some("s1"))]);

        let file = NamedTempFile::new().unwrap();
        selection.save(file.path()).unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.contains("\"externalIdValue\": \"R1\""));
        assert!(content.contains("\"storeLocalId\": \"s1\""));

        let loaded = SelectionSet::load(file.path()).unwrap();
        assert_eq!(loaded, selection);
    }

    #[test]
    fn test_load_without_store_ids() {
        let selection: SelectionSet =
            serde_json::from_str(r#"{"Rule": [{"externalIdValue": "R1"}]}"#).unwrap();
        assert!(selection.store_ids("Rule").is_empty());
        assert_eq!(selection.unresolved_values("Rule"), vec!["R1"]);
    }
}
