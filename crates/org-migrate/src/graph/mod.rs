//! Relationship/phase graph.
//!
//! Object types are nodes carrying their external id and filters; phases are
//! ordered batches of object types; relationships are parent -> child edges
//! carrying the child's lookup field. Each phase entry is classified once at
//! load time as [`ObjectRole::Master`] or [`ObjectRole::Slave`].
//!
//! Validation at load time:
//! - phase numbers are dense, starting at 1
//! - every relationship references declared objects present in its phase
//! - a slave's parent appears in the same phase or an earlier one
//! - the parent graph has no cycles
//! - a relationship's child field is never one of the child's external id fields

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use crate::config::{GraphConfig, ObjectDecl};
use crate::core::identifier::validate_identifier;
use crate::core::ExternalIdSpec;
use crate::error::{MigrateError, Result};

/// One object type.
#[derive(Debug, Clone)]
pub struct ObjectNode {
    pub name: String,
    external_id: Option<ExternalIdSpec>,
    phase_external_ids: BTreeMap<u32, ExternalIdSpec>,
    pub filter: Option<String>,
    pub phase_filters: BTreeMap<u32, String>,
    pub fields: Vec<String>,
}

impl ObjectNode {
    fn from_decl(name: &str, decl: &ObjectDecl) -> Result<Self> {
        validate_identifier(name)?;
        let external_id = decl
            .external_id
            .as_deref()
            .map(ExternalIdSpec::parse)
            .transpose()
            .map_err(|e| graph_err(format!("{}: {}", name, e)))?;
        let mut phase_external_ids = BTreeMap::new();
        for (phase, raw) in &decl.phase_external_ids {
            let spec = ExternalIdSpec::parse(raw)
                .map_err(|e| graph_err(format!("{} (phase {}): {}", name, phase, e)))?;
            phase_external_ids.insert(*phase, spec);
        }
        for field in &decl.fields {
            validate_identifier(field)?;
        }
        Ok(Self {
            name: name.to_string(),
            external_id,
            phase_external_ids,
            filter: decl.filter.clone().filter(|f| !f.trim().is_empty()),
            phase_filters: decl
                .phase_filters
                .iter()
                .filter(|(_, f)| !f.trim().is_empty())
                .map(|(p, f)| (*p, f.clone()))
                .collect(),
            fields: decl.fields.clone(),
        })
    }

    /// External id for this object in `phase`: phase override, then default.
    pub fn external_id(&self, phase: Option<u32>) -> Option<&ExternalIdSpec> {
        phase
            .and_then(|p| self.phase_external_ids.get(&p))
            .or(self.external_id.as_ref())
    }
}

/// Parent -> child edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub parent: String,
    pub child: String,
    /// Lookup on the child that stores the parent's store-local id.
    pub child_field: String,
    pub child_external_id: Option<ExternalIdSpec>,
    pub phase: u32,
}

/// Classification of an object within a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRole {
    /// Records are chosen by a human-curated selection.
    Master,
    /// Records follow already-selected parents.
    Slave { parents: Vec<Relationship> },
}

impl ObjectRole {
    pub fn is_slave(&self) -> bool {
        matches!(self, ObjectRole::Slave { .. })
    }
}

/// An object type's place in a phase.
#[derive(Debug, Clone)]
pub struct PhaseEntry {
    pub object_type: String,
    pub role: ObjectRole,
}

/// An ordered batch of object types.
#[derive(Debug, Clone)]
pub struct Phase {
    pub number: u32,
    pub description: String,
    pub entries: Vec<PhaseEntry>,
}

impl Phase {
    pub fn entry(&self, object_type: &str) -> Option<&PhaseEntry> {
        self.entries.iter().find(|e| e.object_type == object_type)
    }
}

/// Validated object/phase/relationship graph.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    nodes: BTreeMap<String, ObjectNode>,
    phases: Vec<Phase>,
    relationships: Vec<Relationship>,
}

impl PhaseGraph {
    /// Build and validate the graph from its declaration.
    pub fn from_config(config: &GraphConfig) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for (name, decl) in &config.objects {
            nodes.insert(name.clone(), ObjectNode::from_decl(name, decl)?);
        }

        // Phases: dense, starting at 1
        let mut decls: Vec<_> = config.phases.iter().collect();
        decls.sort_by_key(|p| p.number);
        if decls.is_empty() {
            return Err(graph_err("at least one phase is required"));
        }
        for (idx, decl) in decls.iter().enumerate() {
            let expected = idx as u32 + 1;
            if decl.number != expected {
                return Err(graph_err(format!(
                    "phase numbers must be contiguous from 1: expected {}, found {}",
                    expected, decl.number
                )));
            }
            let mut seen = HashSet::new();
            for object in &decl.objects {
                if !seen.insert(object.as_str()) {
                    return Err(graph_err(format!(
                        "phase {} lists {} more than once",
                        decl.number, object
                    )));
                }
                if !nodes.contains_key(object) {
                    warn!(
                        phase = decl.number,
                        "{} has no object declaration and will be skipped when planning", object
                    );
                }
            }
        }

        let position = |phase: u32, object: &str| -> Option<usize> {
            decls
                .get(phase.checked_sub(1)? as usize)?
                .objects
                .iter()
                .position(|o| o == object)
        };

        let mut relationships = Vec::new();
        for rel in &config.relationships {
            let child_node = nodes.get(&rel.child).ok_or_else(|| {
                graph_err(format!("relationship child {} is not declared", rel.child))
            })?;
            if !nodes.contains_key(&rel.parent) {
                return Err(graph_err(format!(
                    "{} declares unknown parent {}",
                    rel.child, rel.parent
                )));
            }
            validate_identifier(&rel.child_field)?;
            if position(rel.phase, &rel.child).is_none() {
                return Err(graph_err(format!(
                    "{} is not part of phase {} declared by its relationship to {}",
                    rel.child, rel.phase, rel.parent
                )));
            }
            let parent_visible = (1..=rel.phase).any(|p| position(p, &rel.parent).is_some());
            if !parent_visible {
                return Err(graph_err(format!(
                    "parent {} of {} does not appear in phase {} or earlier",
                    rel.parent, rel.child, rel.phase
                )));
            }
            let child_external_id = child_node.external_id(Some(rel.phase)).cloned();
            if let Some(spec) = &child_external_id {
                if spec.references_field(&rel.child_field) {
                    return Err(graph_err(format!(
                        "{}.{} is part of the external id and cannot carry the parent id",
                        rel.child, rel.child_field
                    )));
                }
            }
            relationships.push(Relationship {
                parent: rel.parent.clone(),
                child: rel.child.clone(),
                child_field: rel.child_field.clone(),
                child_external_id,
                phase: rel.phase,
            });
        }

        detect_cycles(&relationships)?;

        let phases = decls
            .iter()
            .map(|decl| Phase {
                number: decl.number,
                description: decl.description.clone(),
                entries: decl
                    .objects
                    .iter()
                    .map(|object| {
                        let parents: Vec<Relationship> = relationships
                            .iter()
                            .filter(|r| r.child == *object && r.phase == decl.number)
                            .cloned()
                            .collect();
                        let role = if parents.is_empty() {
                            ObjectRole::Master
                        } else {
                            ObjectRole::Slave { parents }
                        };
                        PhaseEntry {
                            object_type: object.clone(),
                            role,
                        }
                    })
                    .collect(),
            })
            .collect();

        Ok(Self {
            nodes,
            phases,
            relationships,
        })
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, number: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.number == number)
    }

    pub fn node(&self, object_type: &str) -> Option<&ObjectNode> {
        self.nodes.get(object_type)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Resolve the external id for an object, optionally in a specific phase.
    ///
    /// Returns `None` for unknown objects or objects without an external id;
    /// such objects are skipped rather than matched on store-local ids.
    pub fn external_id(&self, object_type: &str, phase: Option<u32>) -> Option<&ExternalIdSpec> {
        self.nodes.get(object_type)?.external_id(phase)
    }

    /// Role of an object in a phase.
    pub fn role(&self, object_type: &str, phase: u32) -> Option<&ObjectRole> {
        self.phase(phase)?.entry(object_type).map(|e| &e.role)
    }

    /// True if the object is a master in at least one phase.
    pub fn is_master_anywhere(&self, object_type: &str) -> bool {
        self.phases.iter().any(|p| {
            p.entry(object_type)
                .map(|e| !e.role.is_slave())
                .unwrap_or(false)
        })
    }
}

fn detect_cycles(relationships: &[Relationship]) -> Result<()> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for rel in relationships {
        children
            .entry(rel.parent.as_str())
            .or_default()
            .push(rel.child.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        node: &'a str,
        children: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(node);
                return Err(graph_err(format!(
                    "cyclic parent reference: {}",
                    path.join(" -> ")
                )));
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        if let Some(next) = children.get(node) {
            for child in next {
                visit(*child, children, marks, path)?;
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut roots: Vec<&str> = children.keys().copied().collect();
    roots.sort_unstable();
    for root in roots {
        visit(root, &children, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

fn graph_err(message: impl Into<String>) -> MigrateError {
    MigrateError::Graph(message.into())
}
