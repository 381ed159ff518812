//! Error types for the Stackwright orchestration engine.
//!
//! This module provides the error hierarchy for every stage of a
//! plan/apply cycle: stack configuration, resource specs, graph
//! construction, provider calls, state persistence and plan execution.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::ResourceId;
use crate::state::LockInfo;

/// The main error type for the Stackwright engine.
#[derive(Debug, Error)]
pub enum StackwrightError {
    /// Stack configuration errors (files, environment, validation).
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed resource specifications.
    #[error("Invalid spec: {0}")]
    Spec(#[from] SpecError),

    /// Structural errors in the dependency graph.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provider failures that escaped the executor.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning and execution errors.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stack configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Malformed resource specification (raised before any graph is built).
#[derive(Debug, Error)]
pub enum SpecError {
    /// Two resources share the same identity.
    #[error("Duplicate resource identity: {id}")]
    DuplicateResource {
        /// The duplicated identity.
        id: ResourceId,
    },

    /// An identity does not follow the naming rules.
    #[error("Invalid resource identity '{value}': {reason}")]
    InvalidIdentity {
        /// The offending identity text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A property holds a reference token that cannot be parsed.
    #[error("Malformed reference '{token}' in {resource}.{property}: {reason}")]
    MalformedReference {
        /// Resource holding the property.
        resource: String,
        /// Property path holding the token.
        property: String,
        /// The raw token.
        token: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A property name is empty or otherwise unusable.
    #[error("Invalid property name '{property}' on {resource}")]
    InvalidProperty {
        /// Resource holding the property.
        resource: String,
        /// The property name.
        property: String,
    },
}

/// Structural errors detected while building the dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency relation contains a cycle.
    #[error("Dependency cycle detected: {}", render_cycle(.path))]
    Cycle {
        /// One full cycle, first node repeated at the end.
        path: Vec<ResourceId>,
        /// Every node lying on some cycle, in identity order.
        members: Vec<ResourceId>,
    },

    /// A resource depends on an identity that is not declared.
    #[error("{from} depends on undeclared resource {missing} (via {via})")]
    DanglingReference {
        /// The resource holding the dependency.
        from: ResourceId,
        /// The missing identity.
        missing: ResourceId,
        /// Property path or `depends_on` that introduced the edge.
        via: String,
    },
}

/// Provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider rejected or failed the request.
    #[error("{operation} failed with status {status}: {message}")]
    Api {
        /// Operation that was attempted.
        operation: String,
        /// Provider status code.
        status: u16,
        /// Error message from the provider.
        message: String,
        /// Whether repeating the call is known to be safe.
        retryable: bool,
    },

    /// Authentication with the provider failed.
    #[error("Provider authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// Rate limited by the provider.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The physical resource does not exist.
    #[error("Physical resource not found: {physical_id}")]
    NotFound {
        /// Provider-assigned id.
        physical_id: String,
    },

    /// Network failure while talking to the provider.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// The provider answered with something unexpected.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The call did not complete within the allowed time.
    #[error("{operation} on {resource} timed out after {timeout_secs}s")]
    Timeout {
        /// Operation that was attempted.
        operation: String,
        /// Resource the call was for.
        resource: String,
        /// Timeout that elapsed.
        timeout_secs: u64,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A held lock was taken over after it expired.
    #[error("State lock {lock_id} is no longer held (now held by: {holder})")]
    LockLost {
        /// The lock this process held.
        lock_id: String,
        /// Who holds the state now, if anyone.
        holder: String,
    },

    /// Storage backend failure.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// A record could not be persisted after a successful provider call.
    #[error("Failed to persist state for {id} after {attempts} attempts: {message}")]
    WriteFailed {
        /// Identity whose record was lost.
        id: ResourceId,
        /// Number of attempts made.
        attempts: u32,
        /// Last backend error.
        message: String,
    },
}

/// Planning and execution errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The state changed since the plan was generated.
    #[error("Plan is stale: state changed since planning (planned against {expected}, found {found})")]
    StalePlan {
        /// Fingerprint the plan was computed against.
        expected: String,
        /// Fingerprint of the current state.
        found: String,
    },

    /// A reference could not be resolved from recorded state.
    #[error("Cannot resolve {reference} for {resource}: {reason}")]
    UnresolvedReference {
        /// Resource whose property holds the reference.
        resource: ResourceId,
        /// The reference, rendered as a token.
        reference: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Execution was aborted before it started.
    #[error("Apply aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Stackwright operations.
pub type Result<T> = std::result::Result<T, StackwrightError>;

fn render_cycle(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl StackwrightError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this is a planning error (invalid spec, cycle, dangling reference).
    #[must_use]
    pub const fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::Spec(_)
                | Self::Graph(_)
                | Self::Config(ConfigError::ParseError { .. } | ConfigError::ValidationError { .. })
        )
    }

    /// Returns the process exit code for this error.
    ///
    /// 1: apply-time failure, 2: planning error, 3: invalid invocation.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(ConfigError::FileNotFound { .. } | ConfigError::MissingEnvVar { .. }) => 3,
            _ if self.is_planning_error() => 2,
            _ => 1,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl SpecError {
    /// Creates an invalid identity error.
    #[must_use]
    pub fn identity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl ProviderError {
    /// Creates an API error.
    #[must_use]
    pub fn api(operation: impl Into<String>, status: u16, message: impl Into<String>, retryable: bool) -> Self {
        Self::Api {
            operation: operation.into(),
            status,
            message: message.into(),
            retryable,
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if repeating the call is known to be safe.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Api { retryable, .. } => *retryable,
            Self::RateLimited { .. } | Self::NetworkError { .. } => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if the provider gave one.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a lost-lock error for `lock_id`, given whatever lock is stored now.
    #[must_use]
    pub fn lock_lost(lock_id: &str, current: Option<&LockInfo>) -> Self {
        Self::LockLost {
            lock_id: lock_id.to_string(),
            holder: current.map_or_else(|| String::from("nobody"), |lock| lock.holder.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: &str, name: &str) -> ResourceId {
        ResourceId::new(kind, name).expect("valid identity")
    }

    #[test]
    fn test_exit_codes() {
        let cycle = StackwrightError::Graph(GraphError::Cycle {
            path: vec![id("network", "a"), id("network", "b"), id("network", "a")],
            members: vec![id("network", "a"), id("network", "b")],
        });
        assert_eq!(cycle.exit_code(), 2);

        let missing = StackwrightError::Config(ConfigError::FileNotFound {
            path: PathBuf::from("stackwright.yaml"),
        });
        assert_eq!(missing.exit_code(), 3);

        let state = StackwrightError::State(StateError::backend("disk full"));
        assert_eq!(state.exit_code(), 1);

        let spec = StackwrightError::Spec(SpecError::DuplicateResource {
            id: id("database", "main"),
        });
        assert_eq!(spec.exit_code(), 2);
    }

    #[test]
    fn test_cycle_message_lists_full_path() {
        let err = GraphError::Cycle {
            path: vec![id("a", "x"), id("b", "y"), id("a", "x")],
            members: vec![id("a", "x"), id("b", "y")],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a.x -> b.y -> a.x");
    }

    #[test]
    fn test_provider_retryability() {
        assert!(ProviderError::network("reset").is_retryable());
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(ProviderError::api("create", 503, "busy", true).is_retryable());
        assert!(!ProviderError::api("create", 400, "bad", false).is_retryable());
        assert!(!ProviderError::Timeout {
            operation: String::from("create"),
            resource: String::from("network.vpc"),
            timeout_secs: 5,
        }
        .is_retryable());
    }
}
