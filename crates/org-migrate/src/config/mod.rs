//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{MigrateError, Result};
use crate::graph::PhaseGraph;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, including the object graph.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Build the validated phase graph.
    pub fn graph(&self) -> Result<PhaseGraph> {
        PhaseGraph::from_config(&self.graph)
    }

    /// Compute a SHA256 hash of the configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl OrgConfig {
    /// Resolve the access token from the inline value or the named environment variable.
    pub fn resolve_access_token(&self) -> Result<String> {
        if let Some(token) = &self.access_token {
            return Ok(token.clone());
        }
        let var = self.access_token_env.as_deref().ok_or_else(|| {
            MigrateError::Config(format!(
                "{}: neither access_token nor access_token_env is set",
                self.alias
            ))
        })?;
        std::env::var(var).map_err(|_| {
            MigrateError::Config(format!(
                "{}: environment variable {} is not set",
                self.alias, var
            ))
        })
    }

    /// Base URL for REST calls, without a trailing slash.
    pub fn api_base(&self) -> String {
        format!(
            "{}/services/data/v{}",
            self.instance_url.trim_end_matches('/'),
            self.api_version
        )
    }
}
