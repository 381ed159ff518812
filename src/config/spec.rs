//! Stack file types.
//!
//! This module defines the structs that map to `stackwright.yaml`: project
//! settings, the state backend, the provider adapter, executor tunables,
//! per-kind capabilities and the flat list of resources.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SpecError;
use crate::model::{CapabilityTable, KindCapabilities, RetryPolicy, SpecSet};
use crate::planner::ExecutorOptions;
use crate::state::STATE_DIR;

/// The root of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider adapter configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tunables.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Capabilities per resource kind.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindConfig>,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, falling back to the AWS default chain.
    #[serde(default)]
    pub region: Option<String>,
    /// Base directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// One JSON file per resource on local disk.
    #[default]
    Local,
    /// One object per resource in S3.
    S3,
}

/// Provider adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Adapter type.
    #[serde(rename = "type", default)]
    pub kind: ProviderKind,
    /// Inventory file for the sandbox adapter.
    #[serde(default)]
    pub inventory: Option<String>,
    /// Base URL for the http adapter.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token for the http adapter.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Request timeout in seconds for the http adapter.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Provider adapter types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local simulated cloud.
    #[default]
    Sandbox,
    /// Generic REST endpoint.
    Http,
}

/// Executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Default per-call timeout in seconds; 0 disables it.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Attempts for each state write.
    #[serde(default = "default_state_write_attempts")]
    pub state_write_attempts: u32,
    /// Initial delay between state write attempts.
    #[serde(default = "default_state_write_backoff")]
    pub state_write_backoff_ms: u64,
}

/// Capabilities of one resource kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindConfig {
    /// Properties that can change in place.
    #[serde(default)]
    pub updatable: Vec<String>,
    /// Properties that always force replacement.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// Create the new instance before deleting the old one on replacement.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Retry policy for retryable provider errors.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-call timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource kind.
    pub kind: String,
    /// Resource name, unique within the kind.
    pub name: String,
    /// Properties; `"${kind.name.attribute}"` strings are references.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Explicit dependencies as `kind.name` identities.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

// Default value functions

const fn default_call_timeout() -> u64 {
    300
}

const fn default_state_write_attempts() -> u32 {
    5
}

const fn default_state_write_backoff() -> u64 {
    200
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            state_write_attempts: default_state_write_attempts(),
            state_write_backoff_ms: default_state_write_backoff(),
        }
    }
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Builds the desired resource set.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identities, malformed references or
    /// duplicate resources.
    pub fn spec_set(&self) -> Result<SpecSet, SpecError> {
        let mut specs = SpecSet::new();
        for resource in &self.resources {
            specs.define_resource(
                &resource.kind,
                &resource.name,
                &resource.properties,
                resource.depends_on.iter().map(String::as_str),
            )?;
        }
        Ok(specs)
    }

    /// Builds the capability table from the `kinds` section.
    #[must_use]
    pub fn capabilities(&self) -> CapabilityTable {
        self.kinds
            .iter()
            .fold(CapabilityTable::new(), |table, (kind, config)| {
                table.with_kind(kind.clone(), config.to_capabilities())
            })
    }

    /// Executor tunables.
    #[must_use]
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            call_timeout: (self.executor.call_timeout_secs > 0)
                .then(|| Duration::from_secs(self.executor.call_timeout_secs)),
            state_write_attempts: self.executor.state_write_attempts,
            state_write_backoff: Duration::from_millis(self.executor.state_write_backoff_ms),
        }
    }

    /// Base directory of the local state backend.
    #[must_use]
    pub fn local_state_dir(&self) -> PathBuf {
        self.state
            .path
            .as_ref()
            .map_or_else(|| PathBuf::from(STATE_DIR), PathBuf::from)
    }

    /// Returns resource identities in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|r| format!("{}.{}", r.kind, r.name))
            .collect()
    }
}

impl KindConfig {
    /// Converts to engine capabilities.
    #[must_use]
    pub fn to_capabilities(&self) -> KindCapabilities {
        KindCapabilities {
            updatable: self.updatable.iter().cloned().collect(),
            replace_on: self.replace_on.iter().cloned().collect(),
            create_before_destroy: self.create_before_destroy,
            retry: self.retry,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceId;

    fn stack(yaml: &str) -> StackConfig {
        serde_yaml::from_str(yaml).expect("valid stack")
    }

    #[test]
    fn test_defaults() {
        let config = stack("project:\n  name: shop\n");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Sandbox);
        assert_eq!(config.executor.call_timeout_secs, 300);
        assert_eq!(config.qualified_name(), "shop-dev");
        assert_eq!(config.local_state_dir(), PathBuf::from(STATE_DIR));
    }

    #[test]
    fn test_spec_set_and_capabilities() {
        let config = stack(
            r#"
project:
  name: shop
kinds:
  database:
    updatable: [instance_class]
    replace_on: [engine]
    retry:
      max_attempts: 3
    timeout_secs: 900
resources:
  - kind: database
    name: main
    properties:
      engine: postgres
      instance_class: db.t3.micro
  - kind: service
    name: api
    properties:
      env:
        DB_HOST: "${database.main.endpoint}"
    depends_on: [database.main]
"#,
        );

        let specs = config.spec_set().expect("specs");
        assert_eq!(specs.len(), 2);
        let api = specs
            .get(&ResourceId::parse("service.api").expect("id"))
            .expect("api");
        assert_eq!(api.references().len(), 1);

        let capabilities = config.capabilities();
        let database = capabilities.get("database");
        assert!(!database.requires_replacement("instance_class"));
        assert!(database.requires_replacement("engine"));
        assert_eq!(database.retry_policy().max_attempts, 3);
        assert_eq!(database.timeout, Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let config = stack(
            r"
project:
  name: shop
resources:
  - kind: queue
    name: jobs
  - kind: queue
    name: jobs
",
        );
        assert!(matches!(config.spec_set(), Err(SpecError::DuplicateResource { .. })));
    }

    #[test]
    fn test_zero_timeout_disables_it() {
        let config = stack("project:\n  name: shop\nexecutor:\n  call_timeout_secs: 0\n");
        assert_eq!(config.executor_options().call_timeout, None);
        assert_eq!(config.executor_options().state_write_attempts, 5);
    }
}
