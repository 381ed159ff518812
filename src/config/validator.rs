//! Stack validation.
//!
//! Checks a parsed stack for values that would only fail later: bad names,
//! incomplete backend settings, contradictory kind capabilities. Graph-level
//! checks (cycles, dangling references) belong to the graph builder.

use crate::error::{ConfigError, Result, StackwrightError};
use crate::model::{ResourceId, is_valid_name};
use std::collections::BTreeSet;
use tracing::debug;

use super::spec::{ExecutorConfig, KindConfig, ProjectConfig, ProviderConfig, ProviderKind, StackConfig, StateBackend, StateConfig};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack and fails on the first error found.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(StackwrightError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Stack validation passed with {} warnings", result.warnings.len());
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_executor(&config.executor, &mut result);
        for (kind, kind_config) in &config.kinds {
            Self::validate_kind(kind, kind_config, &mut result);
        }
        Self::validate_resources(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using the s3 backend");
                }
                if state.path.is_some() {
                    result.warn("state.path is ignored by the s3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() || state.prefix.is_some() {
                    result.warn("state.bucket and state.prefix are ignored by the local backend");
                }
            }
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match &provider.endpoint {
                None => result.error("provider.endpoint", "An endpoint is required for the http provider"),
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Sandbox => {
                if provider.endpoint.is_some() || provider.token_env.is_some() {
                    result.warn("provider.endpoint and provider.token_env are ignored by the sandbox provider");
                }
            }
        }

        if provider.timeout_secs == Some(0) {
            result.error("provider.timeout_secs", "Request timeout must be at least 1 second");
        }
    }

    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.state_write_attempts == 0 {
            result.error("executor.state_write_attempts", "At least one state write attempt is required");
        }
        if executor.call_timeout_secs == 0 {
            result.warn("executor.call_timeout_secs is 0: provider calls have no default timeout");
        }
    }

    fn validate_kind(kind: &str, config: &KindConfig, result: &mut ValidationResult) {
        let field = format!("kinds.{kind}");

        if !is_valid_name(kind) {
            result.error(&field, format!("Kind '{kind}' is invalid. Must be lowercase alphanumeric with hyphens."));
        }

        let updatable: BTreeSet<&String> = config.updatable.iter().collect();
        for property in &config.replace_on {
            if updatable.contains(property) {
                result.error(
                    format!("{field}.replace_on"),
                    format!("Property '{property}' cannot be both updatable and in replace_on"),
                );
            }
        }

        if let Some(retry) = &config.retry {
            if retry.max_attempts == 0 {
                result.error(format!("{field}.retry.max_attempts"), "Retry needs at least one attempt");
            }
            if retry.initial_backoff_ms > retry.max_backoff_ms {
                result.error(
                    format!("{field}.retry"),
                    "initial_backoff_ms cannot exceed max_backoff_ms",
                );
            }
        }

        if config.timeout_secs == Some(0) {
            result.error(format!("{field}.timeout_secs"), "Timeout must be at least 1 second");
        }
    }

    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warn("No resources declared; apply would destroy everything in state");
        }

        let mut seen = BTreeSet::new();
        let mut unconfigured = BTreeSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            match ResourceId::new(&resource.kind, &resource.name) {
                Ok(id) => {
                    if !seen.insert(id.clone()) {
                        result.error(&field, format!("Duplicate resource identity: {id}"));
                    }
                }
                Err(e) => result.error(&field, e.to_string()),
            }

            for dep in &resource.depends_on {
                if let Err(e) = ResourceId::parse(dep) {
                    result.error(format!("{field}.depends_on"), e.to_string());
                }
            }

            if !config.kinds.contains_key(&resource.kind) {
                unconfigured.insert(resource.kind.as_str());
            }
        }

        for kind in unconfigured {
            result.warn(format!(
                "Kind '{kind}' has no capabilities configured: every property change replaces the resource"
            ));
        }

        let used: BTreeSet<&str> = config.resources.iter().map(|r| r.kind.as_str()).collect();
        for kind in config.kinds.keys() {
            if !used.contains(kind.as_str()) {
                result.warn(format!("Kind '{kind}' is configured but no resource uses it"));
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn check(yaml: &str) -> ValidationResult {
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        ConfigValidator::new().check(&config)
    }

    fn fields(result: &ValidationResult) -> Vec<&str> {
        result.errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_valid_stack() {
        let result = check(
            r"
project:
  name: shop
kinds:
  queue:
    updatable: [visibility_timeout]
resources:
  - kind: queue
    name: jobs
    properties:
      visibility_timeout: 30
",
        );
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let result = check("project:\n  name: shop\nstate:\n  backend: s3\n");
        assert_eq!(fields(&result), ["state.bucket"]);
    }

    #[test]
    fn test_http_requires_endpoint() {
        let result = check("project:\n  name: shop\nprovider:\n  type: http\n");
        assert_eq!(fields(&result), ["provider.endpoint"]);

        let result = check("project:\n  name: shop\nprovider:\n  type: http\n  endpoint: ftp://cloud\n");
        assert_eq!(fields(&result), ["provider.endpoint"]);
    }

    #[test]
    fn test_contradictory_capabilities() {
        let result = check(
            r"
project:
  name: shop
kinds:
  database:
    updatable: [engine]
    replace_on: [engine]
    retry:
      max_attempts: 3
      initial_backoff_ms: 5000
      max_backoff_ms: 100
",
        );
        assert_eq!(fields(&result), ["kinds.database.replace_on", "kinds.database.retry"]);
    }

    #[test]
    fn test_resource_identity_problems() {
        let result = check(
            r"
project:
  name: shop
resources:
  - kind: Queue
    name: jobs
  - kind: queue
    name: jobs
  - kind: queue
    name: jobs
    depends_on: [not-an-identity]
",
        );
        assert_eq!(
            fields(&result),
            ["resources[0]", "resources[2]", "resources[2].depends_on"]
        );
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let config = ConfigParser::new()
            .parse_yaml("project:\n  name: shop\nkinds:\n  cache: {}\n", None)
            .expect("parse");
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 2);
    }

    #[test]
    fn test_validate_reports_first_error() {
        let config = ConfigParser::new()
            .parse_yaml("project:\n  name: Shop\n", None)
            .expect("parse");
        let err = ConfigValidator::new().validate(&config).expect_err("invalid");
        assert_eq!(err.exit_code(), 2);
    }
}
