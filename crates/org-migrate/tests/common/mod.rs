//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use org_migrate::error::{MigrateError, Result};
use org_migrate::{MetadataDescriber, QueryPage, Record, RecordStore};
use serde_json::Value;

/// Store that answers queries from scripted responses and records every
/// query it receives.
///
/// The first rule whose pattern is a substring of the query wins; queries
/// matching no rule return no records. Failure patterns are checked first.
pub struct ScriptedStore {
    name: String,
    failures: Vec<String>,
    rules: Vec<(String, Vec<Record>)>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: Vec::new(),
            rules: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(mut self, pattern: &str, records: Vec<Value>) -> Self {
        let records = records
            .into_iter()
            .map(|v| v.as_object().cloned().expect("scripted records are objects"))
            .collect();
        self.rules.push((pattern.to_string(), records));
        self
    }

    /// Fail every query containing `pattern`.
    pub fn fail(mut self, pattern: &str) -> Self {
        self.failures.push(pattern.to_string());
        self
    }

    /// Every query seen so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Number of queries containing `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.contains(needle))
            .count()
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn query_page(&self, query: &str, _cursor: Option<&str>) -> Result<QueryPage> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.failures.iter().any(|p| query.contains(p.as_str())) {
            return Err(MigrateError::store(&self.name, "scripted failure"));
        }
        let records = self
            .rules
            .iter()
            .find(|(pattern, _)| query.contains(pattern.as_str()))
            .map(|(_, records)| records.clone())
            .unwrap_or_default();
        Ok(QueryPage {
            total_size: records.len() as u64,
            records,
            next_cursor: None,
        })
    }

    fn store_name(&self) -> &str {
        &self.name
    }
}

/// Describer that reports the same fields for every object type.
pub struct FixedDescriber {
    pub fields: Vec<String>,
}

impl FixedDescriber {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[async_trait]
impl MetadataDescriber for FixedDescriber {
    async fn describe_fields(&self, _object_type: &str) -> Result<Vec<String>> {
        Ok(self.fields.clone())
    }
}

/// Config for a two-phase graph: `Rule -> RuleLine` in phase 1 and an
/// insert-only `Account` master in phase 2.
pub fn config_yaml(output_dir: &std::path::Path, selection_file: &std::path::Path) -> String {
    format!(
        r#"
source:
  alias: dev
  instance_url: https://dev.example.com
target:
  alias: prod
  instance_url: https://prod.example.com
  username: integration@example.com
migration:
  selection_file: {selection}
  output_dir: {output}
  phase_operations:
    2: Insert
graph:
  objects:
    Rule: {{ external_id: Name }}
    RuleLine: {{ external_id: "Rule.Name;LineIndex" }}
    Account: {{ external_id: Name, filter: "Industry = 'Tech'" }}
  phases:
    - {{ number: 1, description: Rules, objects: [Rule, RuleLine] }}
    - {{ number: 2, description: Accounts, objects: [Account] }}
  relationships:
    - {{ parent: Rule, child: RuleLine, child_field: RuleId, phase: 1 }}
"#,
        selection = selection_file.display(),
        output = output_dir.display(),
    )
}
