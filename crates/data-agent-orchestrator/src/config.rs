use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use data_agent_actor::{ActorSettings, SchemaContext, DEFAULT_MAX_RETRIES};
use data_agent_domain::ResourceQuota;
use data_agent_policy::PolicyConfig;
use data_agent_recipe_core::{
    EmbeddingProvider, HashingEmbeddingProvider, HttpEmbeddingConfig, HttpEmbeddingProvider,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RECIPE_MIN_SIMILARITY: f64 = 0.85;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_retries: u32,
    pub recipe_top_k: usize,
    pub recipe_min_similarity: f64,
    pub short_circuit_failed_dependencies: bool,
    pub quota: ResourceQuota,
    pub policy: PolicyConfig,
    pub schema_context: SchemaContext,
    pub audit_log_path: PathBuf,
    pub recipe_db_path: PathBuf,
    pub embedding_dimensions: usize,
    /// Remote embedder; the offline hashing embedder is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_embedding: Option<HttpEmbeddingConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            recipe_top_k: 1,
            recipe_min_similarity: DEFAULT_RECIPE_MIN_SIMILARITY,
            short_circuit_failed_dependencies: false,
            quota: ResourceQuota::default(),
            policy: PolicyConfig::default(),
            schema_context: SchemaContext::default(),
            audit_log_path: PathBuf::from("data/audit/audit_log.jsonl"),
            recipe_db_path: PathBuf::from("data/recipes.db"),
            embedding_dimensions: 256,
            http_embedding: None,
        }
    }
}

impl AgentConfig {
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid agent config YAML: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.recipe_top_k == 0 {
            return Err(anyhow!("recipe_top_k MUST be greater than zero"));
        }
        if !(-1.0..=1.0).contains(&self.recipe_min_similarity) {
            return Err(anyhow!(
                "recipe_min_similarity MUST be within [-1, 1], got {}",
                self.recipe_min_similarity
            ));
        }
        let timeout = self.quota.max_execution_seconds;
        if timeout.is_nan() || timeout <= 0.0 {
            return Err(anyhow!(
                "quota.max_execution_seconds MUST be positive, got {timeout}"
            ));
        }
        if self.embedding_dimensions == 0 && self.http_embedding.is_none() {
            return Err(anyhow!("embedding_dimensions MUST be greater than zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn actor_settings(&self) -> ActorSettings {
        ActorSettings {
            max_retries: self.max_retries,
            quota: self.quota.clone(),
            schema_context: self.schema_context.clone(),
            enforce_query_policy: self.policy.enforce_query_policy,
            scan_results_for_pii: self.policy.scan_results_for_pii,
        }
    }

    /// # Errors
    /// Returns an error when the configured embedder cannot be constructed.
    pub fn embedding_provider(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        match &self.http_embedding {
            Some(http) => Ok(Arc::new(HttpEmbeddingProvider::new(http.clone())?)),
            None => Ok(Arc::new(HashingEmbeddingProvider::new(
                self.embedding_dimensions,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AgentConfig;
    use std::path::PathBuf;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.recipe_top_k, 1);
        assert!((config.recipe_min_similarity - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.audit_log_path, PathBuf::from("data/audit/audit_log.jsonl"));
        assert_eq!(config.recipe_db_path, PathBuf::from("data/recipes.db"));
        assert_eq!(config.embedding_dimensions, 256);
        assert_eq!(config.policy.blocked_columns.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AgentConfig::from_yaml_str(
            "max_retries: 5\nquota:\n  max_rows: 50\nschema_context:\n  table_name: sales\n",
        );
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.quota.max_rows, 50);
        assert_eq!(config.quota.max_memory_mb, 1024);
        assert_eq!(config.schema_context.table_name.as_deref(), Some("sales"));
        assert_eq!(config.actor_settings().quota.max_rows, 50);
    }

    #[test]
    fn validation_rejects_bad_values() {
        for yaml in [
            "recipe_top_k: 0\n",
            "recipe_min_similarity: 1.5\n",
            "quota:\n  max_execution_seconds: 0\n",
            "embedding_dimensions: 0\n",
        ] {
            assert!(AgentConfig::from_yaml_str(yaml).is_err(), "accepted: {yaml}");
        }
        assert!(AgentConfig::from_yaml_str("max_retries: [1]\n").is_err());
    }

    #[test]
    fn embedder_follows_config() {
        let offline = AgentConfig::default().embedding_provider();
        assert!(offline.is_ok());
        let offline = offline.unwrap_or_else(|_| unreachable!());
        assert_eq!(offline.provider_name(), "hashing");

        let remote = AgentConfig::from_yaml_str(
            "http_embedding:\n  url: http://127.0.0.1:9/embed\n  auth_bearer_env: EMBED_TOKEN\n",
        );
        assert!(remote.is_ok());
        let remote = remote
            .unwrap_or_else(|_| unreachable!())
            .embedding_provider();
        assert!(remote.is_ok());
        assert_eq!(remote.unwrap_or_else(|_| unreachable!()).provider_name(), "http_json");
    }
}
