//! Configuration validation.

use super::{Config, OrgConfig};
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};
use crate::graph::PhaseGraph;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_org("source", &config.source)?;
    validate_org("target", &config.target)?;

    // Cannot migrate into the organization we read from
    if config.source.instance_url.trim_end_matches('/')
        == config.target.instance_url.trim_end_matches('/')
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same organization".into(),
        ));
    }

    if let Some(0) = config.migration.concurrency {
        return Err(MigrateError::Config(
            "migration.concurrency must be at least 1".into(),
        ));
    }
    if let Some(0) = config.migration.reconcile_chunk_size {
        return Err(MigrateError::Config(
            "migration.reconcile_chunk_size must be at least 1".into(),
        ));
    }

    for object in config
        .migration
        .excluded_objects
        .iter()
        .chain(&config.migration.opt_in_objects)
        .chain(config.migration.custom_filters.keys())
    {
        validate_identifier(object)?;
    }

    for object in &config.migration.opt_in_objects {
        if !config.migration.is_excluded(object) {
            return Err(MigrateError::Config(format!(
                "migration.opt_in_objects lists {} which is not in excluded_objects",
                object
            )));
        }
    }

    PhaseGraph::from_config(&config.graph)?;

    Ok(())
}

fn validate_org(side: &str, org: &OrgConfig) -> Result<()> {
    if org.alias.is_empty() {
        return Err(MigrateError::Config(format!("{}.alias is required", side)));
    }
    if org.instance_url.is_empty() {
        return Err(MigrateError::Config(format!(
            "{}.instance_url is required",
            side
        )));
    }
    if !org.instance_url.starts_with("https://") && !org.instance_url.starts_with("http://") {
        return Err(MigrateError::Config(format!(
            "{}.instance_url must be an http(s) URL, got '{}'",
            side, org.instance_url
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        GraphConfig, MigrationConfig, ObjectDecl, OrgConfig, PhaseDecl,
    };

    fn org(alias: &str, url: &str) -> OrgConfig {
        OrgConfig {
            alias: alias.to_string(),
            instance_url: url.to_string(),
            api_version: "59.0".to_string(),
            username: None,
            access_token_env: Some("TOKEN".to_string()),
            access_token: None,
        }
    }

    fn valid_config() -> Config {
        let mut graph = GraphConfig::default();
        graph.objects.insert(
            "Rule".to_string(),
            ObjectDecl {
                external_id: Some("Name".to_string()),
                ..Default::default()
            },
        );
        graph.phases.push(PhaseDecl {
            number: 1,
            description: "Rules".to_string(),
            objects: vec!["Rule".to_string()],
        });
        Config {
            source: org("dev", "https://dev.example.com"),
            target: org("prod", "https://prod.example.com"),
            migration: MigrationConfig::default(),
            graph,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_alias() {
        let mut config = valid_config();
        config.source.alias = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_org_rejected() {
        let mut config = valid_config();
        config.target.instance_url = "https://dev.example.com/".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = valid_config();
        config.migration.concurrency = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_opt_in_requires_exclusion() {
        let mut config = valid_config();
        config.migration.opt_in_objects = vec!["Order".to_string()];
        assert!(validate(&config).is_err());
        config.migration.excluded_objects = vec!["Order".to_string()];
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_graph_rejected() {
        let mut config = valid_config();
        config.graph.phases[0].number = 2;
        assert!(matches!(validate(&config), Err(MigrateError::Graph(_))));
    }

    #[test]
    fn test_org_config_debug_redacts_token() {
        let mut config = valid_config();
        config.source.access_token = Some("super_secret_token_123".to_string());
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_token_123"));
    }

    #[test]
    fn test_operation_fallback_chain() {
        use crate::config::Operation;
        let mut migration = MigrationConfig::default();
        assert_eq!(migration.operation_for_phase(1), Operation::Upsert);
        migration.operation = Some(Operation::Update);
        assert_eq!(migration.operation_for_phase(1), Operation::Update);
        migration.phase_operations.insert(1, Operation::Insert);
        assert_eq!(migration.operation_for_phase(1), Operation::Insert);
        assert_eq!(migration.operation_for_phase(2), Operation::Update);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
source: { alias: dev, instance_url: "https://dev.example.com" }
target: { alias: prod, instance_url: "https://prod.example.com" }
migration:
  operation: Upsert
  phase_operations: { 1: Insert }
  modified_since: 2024-01-01T00:00:00Z
graph:
  objects:
    Rule: { external_id: Name }
  phases:
    - { number: 1, objects: [Rule] }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.source.api_version, "59.0");
        assert_eq!(
            config.migration.operation_for_phase(1),
            crate::config::Operation::Insert
        );
        assert!(config.migration.modified_since.is_some());
        assert_eq!(config.hash().len(), 64);
    }
}
