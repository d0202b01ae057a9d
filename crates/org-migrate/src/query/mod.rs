//! Query builder.
//!
//! Assembles one query per object from the graph, the external id spec and the
//! migration filters. WHERE conditions are appended in a fixed order and no
//! step removes an earlier condition:
//!
//! 1. field list (identifier, base lookups, traversal paths, extra fields)
//! 2. phase-specific structural filter
//! 3. object business filter
//! 4. always-false guard for hard-excluded objects
//! 5. incremental `LastModifiedDate` cutoff
//! 6. user custom filter fragments
//! 7. master selection filter, or slave parent-id filter
//!
//! The builder is pure: identical inputs always produce identical text.

pub mod rewrite;

use tracing::{debug, warn};

use crate::config::{MigrationConfig, PartialValuePolicy};
use crate::core::identifier::{datetime_literal, in_list, quote_literal};
use crate::core::{ExternalIdSpec, ID_FIELD};
use crate::graph::{ObjectRole, PhaseGraph, Relationship};
use crate::selection::SelectionSet;

pub use rewrite::{
    compose, group, leading_field, replace_select_list, split_conjuncts, split_query,
    where_clause, QueryParts,
};

/// Condition that never matches a record.
pub const ALWAYS_FALSE: &str = "Id = null";

/// Field used by the incremental filter.
pub const LAST_MODIFIED_FIELD: &str = "LastModifiedDate";

/// A built query and how it was constrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltQuery {
    pub query: String,
    /// A slave whose parents have no known store-local ids; the query carries
    /// no parent filter and record selection is left to the transfer tool.
    pub deferred: bool,
    /// The always-false exclusion guard was applied.
    pub guarded: bool,
}

/// Builds per-object queries for one migration context.
pub struct QueryBuilder<'a> {
    graph: &'a PhaseGraph,
    migration: &'a MigrationConfig,
    selections: &'a SelectionSet,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(
        graph: &'a PhaseGraph,
        migration: &'a MigrationConfig,
        selections: &'a SelectionSet,
    ) -> Self {
        Self {
            graph,
            migration,
            selections,
        }
    }

    /// Build the query for `object_type` in `phase` with the given role.
    pub fn build(
        &self,
        object_type: &str,
        phase: Option<u32>,
        spec: &ExternalIdSpec,
        role: &ObjectRole,
    ) -> BuiltQuery {
        let node = self.graph.node(object_type);
        let extra_fields = node.map(|n| n.fields.as_slice()).unwrap_or(&[]);
        let fields = select_fields(spec, extra_fields);

        let mut clauses: Vec<String> = Vec::new();

        if let (Some(node), Some(phase)) = (node, phase) {
            if let Some(filter) = node.phase_filters.get(&phase) {
                clauses.push(group(filter));
            }
        }

        if let Some(filter) = node.and_then(|n| n.filter.as_deref()) {
            clauses.push(group(filter));
        }

        let guarded = self.migration.is_excluded(object_type);
        if guarded {
            clauses.push(ALWAYS_FALSE.to_string());
        }

        if let Some(cutoff) = &self.migration.modified_since {
            clauses.push(format!("{} >= {}", LAST_MODIFIED_FIELD, datetime_literal(cutoff)));
        }

        if let Some(custom) = self.migration.custom_filters.get(object_type) {
            clauses.extend(split_conjuncts(custom).iter().map(|f| group(f)));
        }

        let mut deferred = false;
        match role {
            ObjectRole::Master => {
                if let Some(filter) = self.master_filter(object_type, spec) {
                    clauses.push(filter);
                }
            }
            ObjectRole::Slave { parents } => match self.slave_filter(parents) {
                Some(filter) => clauses.push(filter),
                None => {
                    debug!("{}: no parent ids known, deferring to parent resolution", object_type);
                    deferred = true;
                }
            },
        }

        let rest = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        BuiltQuery {
            query: compose(&fields.join(", "), object_type, &rest),
            deferred,
            guarded,
        }
    }

    /// Filter a master object by its selection.
    ///
    /// Store-local ids are exact and preferred: once any are known, selected
    /// records without one are left out. External id values are used only
    /// when no id is known, or alongside the ids when
    /// `include_unresolved_selections` is set.
    fn master_filter(&self, object_type: &str, spec: &ExternalIdSpec) -> Option<String> {
        let ids = self.selections.store_ids(object_type);
        let unresolved = self.selections.unresolved_values(object_type);

        if !ids.is_empty() && !unresolved.is_empty() && !self.migration.include_unresolved_selections
        {
            warn!(
                "{}: {} selected records have no store-local id and are not planned; run resolve-selection first",
                object_type,
                unresolved.len()
            );
            return Some(in_list(ID_FIELD, &ids));
        }

        let by_id = (!ids.is_empty()).then(|| in_list(ID_FIELD, &ids));
        let by_value = external_id_filter(
            object_type,
            spec,
            &unresolved,
            self.migration.composite_partial_policy,
        );

        match (by_id, by_value) {
            (Some(id), Some(value)) => Some(format!("({} OR {})", id, value)),
            (Some(id), None) => Some(id),
            (None, value) => value,
        }
    }

    /// Filter a slave object by its parents' selected store-local ids.
    fn slave_filter(&self, parents: &[Relationship]) -> Option<String> {
        let conditions: Vec<String> = parents
            .iter()
            .filter_map(|rel| {
                let ids = self.selections.store_ids(&rel.parent);
                (!ids.is_empty()).then(|| in_list(&rel.child_field, &ids))
            })
            .collect();
        match conditions.len() {
            0 => None,
            1 => conditions.into_iter().next(),
            _ => Some(format!("({})", conditions.join(" OR "))),
        }
    }
}

/// Select list for an object: identifier, base lookup fields, then key part
/// paths and extra fields, without duplicates.
///
/// Lookups precede traversal paths because the transfer tool needs the lookup
/// column before it can resolve the relationship.
pub fn select_fields(spec: &ExternalIdSpec, extra: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = vec![ID_FIELD.to_string()];
    let candidates = spec
        .lookup_fields()
        .into_iter()
        .chain(spec.paths().into_iter().map(str::to_string))
        .chain(extra.iter().cloned());
    for field in candidates {
        if !fields.iter().any(|f| f.eq_ignore_ascii_case(&field)) {
            fields.push(field);
        }
    }
    fields
}

/// Filter matching records by external id values.
///
/// Single-field specs produce an `IN` list. Composite specs produce an OR of
/// per-part AND groups; a value contributes a branch only when every part
/// decodes to a non-empty value.
pub fn external_id_filter<S: AsRef<str>>(
    object_type: &str,
    spec: &ExternalIdSpec,
    values: &[S],
    policy: PartialValuePolicy,
) -> Option<String> {
    let values: Vec<&str> = values
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return None;
    }

    if !spec.is_composite() {
        return Some(in_list(spec.paths()[0], &values));
    }

    let paths = spec.paths();
    let mut branches = Vec::new();
    for value in values {
        match spec.decode_complete(value) {
            Some(parts) => {
                let conditions: Vec<String> = paths
                    .iter()
                    .zip(parts.iter())
                    .map(|(path, part)| format!("{} = {}", path, quote_literal(part)))
                    .collect();
                branches.push(format!("({})", conditions.join(" AND ")));
            }
            None => {
                if policy == PartialValuePolicy::Warn {
                    warn!(
                        "{}: dropping composite value {:?} that does not supply every part of {}",
                        object_type, value, spec
                    );
                }
            }
        }
    }

    match branches.len() {
        0 => None,
        1 => branches.into_iter().next(),
        _ => Some(format!("({})", branches.join(" OR "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GraphConfig, ObjectDecl, PhaseDecl, RelationshipDecl};
    use crate::selection::SelectedRecord;
    use chrono::TimeZone;

    fn graph() -> PhaseGraph {
        let mut config = GraphConfig::default();
        config.objects.insert(
            "Rule".into(),
            ObjectDecl {
                external_id: Some("Name".into()),
                filter: Some("IsDefault = false".into()),
                ..Default::default()
            },
        );
        config.objects.insert(
            "RuleLine".into(),
            ObjectDecl {
                external_id: Some("Rule.Name;LineIndex".into()),
                ..Default::default()
            },
        );
        let mut lookup = ObjectDecl {
            external_id: Some("Name".into()),
            ..Default::default()
        };
        lookup
            .phase_filters
            .insert(2, "PriceRuleId != null".into());
        config.objects.insert("LookupQuery".into(), lookup);
        config.phases.push(PhaseDecl {
            number: 1,
            description: String::new(),
            objects: vec!["Rule".into(), "RuleLine".into()],
        });
        config.phases.push(PhaseDecl {
            number: 2,
            description: String::new(),
            objects: vec!["LookupQuery".into()],
        });
        config.relationships.push(RelationshipDecl {
            parent: "Rule".into(),
            child: "RuleLine".into(),
            child_field: "RuleId".into(),
            phase: 1,
        });
        PhaseGraph::from_config(&config).unwrap()
    }

    fn spec(raw: &str) -> ExternalIdSpec {
        ExternalIdSpec::parse(raw).unwrap()
    }

    #[test]
    fn test_select_fields_lookup_before_traversal() {
        let fields = select_fields(&spec("Rule.Name;LineIndex"), &["lineindex".to_string()]);
        assert_eq!(fields, vec!["Id", "RuleId", "Rule.Name", "LineIndex"]);
    }

    #[test]
    fn test_master_filter_by_store_id() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set("Rule", vec![SelectedRecord::new("R1", Some("s1"))]);
        let builder = QueryBuilder::new(&graph, &migration, &selections);

        let built = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        assert_eq!(
            built.query,
            "SELECT Id, Name FROM Rule WHERE IsDefault = false AND Id IN ('s1')"
        );
        assert!(!built.deferred);
    }

    #[test]
    fn test_master_filter_falls_back_to_external_id() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set("Rule", vec![SelectedRecord::new("R1", None)]);
        let builder = QueryBuilder::new(&graph, &migration, &selections);

        let built = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        assert!(built.query.ends_with("AND Name IN ('R1')"));
    }

    #[test]
    fn test_mixed_selection_prefers_ids() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set(
            "Rule",
            vec![
                SelectedRecord::new("R1", Some("s1")),
                SelectedRecord::new("R2", None),
            ],
        );
        let builder = QueryBuilder::new(&graph, &migration, &selections);
        let built = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        assert!(built.query.ends_with("WHERE Id IN ('s1')"));
        assert!(!built.query.contains("R2"));
    }

    #[test]
    fn test_mixed_selection_can_include_unresolved() {
        let graph = graph();
        let migration = MigrationConfig {
            include_unresolved_selections: true,
            ..Default::default()
        };
        let mut selections = SelectionSet::new();
        selections.set(
            "Rule",
            vec![
                SelectedRecord::new("R1", Some("s1")),
                SelectedRecord::new("R2", None),
            ],
        );
        let builder = QueryBuilder::new(&graph, &migration, &selections);
        let built = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        assert!(built.query.ends_with("(Id IN ('s1') OR Name IN ('R2'))"));
    }

    #[test]
    fn test_slave_filter_uses_parent_ids() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set("Rule", vec![SelectedRecord::new("R1", Some("s1"))]);
        let builder = QueryBuilder::new(&graph, &migration, &selections);

        let role = graph.role("RuleLine", 1).unwrap();
        let built = builder.build("RuleLine", Some(1), &spec("Rule.Name;LineIndex"), role);
        assert_eq!(
            built.query,
            "SELECT Id, RuleId, Rule.Name, LineIndex FROM RuleLine WHERE RuleId IN ('s1')"
        );
    }

    #[test]
    fn test_slave_without_parent_ids_is_deferred() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set("Rule", vec![SelectedRecord::new("R1", None)]);
        let builder = QueryBuilder::new(&graph, &migration, &selections);

        let role = graph.role("RuleLine", 1).unwrap();
        let built = builder.build("RuleLine", Some(1), &spec("Rule.Name;LineIndex"), role);
        assert!(built.deferred);
        assert_eq!(built.query, "SELECT Id, RuleId, Rule.Name, LineIndex FROM RuleLine");
    }

    #[test]
    fn test_clause_order() {
        let graph = graph();
        let mut migration = MigrationConfig::default();
        migration.excluded_objects = vec!["LookupQuery".into()];
        migration.modified_since = Some(chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        migration
            .custom_filters
            .insert("LookupQuery".into(), "Active = true AND (A = 1 OR B = 2)".into());
        let mut selections = SelectionSet::new();
        selections.set("LookupQuery", vec![SelectedRecord::new("Q1", Some("q1"))]);
        let builder = QueryBuilder::new(&graph, &migration, &selections);

        let built = builder.build("LookupQuery", Some(2), &spec("Name"), &ObjectRole::Master);
        assert!(built.guarded);
        assert_eq!(
            built.query,
            "SELECT Id, Name FROM LookupQuery WHERE PriceRuleId != null AND Id = null \
             AND LastModifiedDate >= 2024-01-01T00:00:00Z AND Active = true \
             AND (A = 1 OR B = 2) AND Id IN ('q1')"
        );
    }

    #[test]
    fn test_phase_filter_only_in_its_phase() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let selections = SelectionSet::new();
        let builder = QueryBuilder::new(&graph, &migration, &selections);
        let built = builder.build("LookupQuery", Some(1), &spec("Name"), &ObjectRole::Master);
        assert_eq!(built.query, "SELECT Id, Name FROM LookupQuery");
    }

    #[test]
    fn test_composite_external_id_filter() {
        let filter = external_id_filter(
            "RuleLine",
            &spec("Rule.Name;LineIndex"),
            &["R1|1", "R1|", "R2|2"],
            PartialValuePolicy::Warn,
        )
        .unwrap();
        assert_eq!(
            filter,
            "((Rule.Name = 'R1' AND LineIndex = '1') OR (Rule.Name = 'R2' AND LineIndex = '2'))"
        );
    }

    #[test]
    fn test_composite_filter_all_partial_is_none() {
        let filter = external_id_filter(
            "RuleLine",
            &spec("Rule.Name;LineIndex"),
            &["R1|", "|2"],
            PartialValuePolicy::Silent,
        );
        assert_eq!(filter, None);
    }

    #[test]
    fn test_builder_is_deterministic() {
        let graph = graph();
        let migration = MigrationConfig::default();
        let mut selections = SelectionSet::new();
        selections.set(
            "Rule",
            vec![
                SelectedRecord::new("R2", Some("s2")),
                SelectedRecord::new("R1", Some("s1")),
            ],
        );
        let builder = QueryBuilder::new(&graph, &migration, &selections);
        let a = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        let b = builder.build("Rule", Some(1), &spec("Name"), &ObjectRole::Master);
        assert_eq!(a, b);
    }
}
