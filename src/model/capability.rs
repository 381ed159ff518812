//! Per-kind provider capabilities.
//!
//! The capability table tells the diff engine which property changes can be
//! applied in place, and tells the executor how to replace, retry and time
//! out calls for each resource kind.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Order of the two provider calls that make up a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Delete the old instance, then create the new one.
    #[default]
    DeleteBeforeCreate,
    /// Create the new instance, then delete the old one.
    CreateBeforeDestroy,
}

impl std::fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeleteBeforeCreate => write!(f, "delete-before-create"),
            Self::CreateBeforeDestroy => write!(f, "create-before-destroy"),
        }
    }
}

/// Bounded exponential backoff for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl RetryPolicy {
    /// Policy that makes a single attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

/// What a provider can do for one resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindCapabilities {
    /// Properties that can change in place.
    pub updatable: BTreeSet<String>,
    /// Properties that always force replacement.
    pub replace_on: BTreeSet<String>,
    /// Whether replacements create the new instance first.
    pub create_before_destroy: bool,
    /// Retry policy for retryable provider errors. `None` disables retries.
    pub retry: Option<RetryPolicy>,
    /// Per-call timeout, overriding the executor default.
    pub timeout: Option<Duration>,
}

impl KindCapabilities {
    /// Returns true if changing `property` requires replacing the resource.
    ///
    /// Properties the table does not mention are treated as immutable.
    #[must_use]
    pub fn requires_replacement(&self, property: &str) -> bool {
        self.replace_on.contains(property) || !self.updatable.contains(property)
    }

    /// Replacement order for this kind.
    #[must_use]
    pub const fn replace_strategy(&self) -> ReplaceStrategy {
        if self.create_before_destroy {
            ReplaceStrategy::CreateBeforeDestroy
        } else {
            ReplaceStrategy::DeleteBeforeCreate
        }
    }

    /// Retry policy, falling back to a single attempt.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_else(RetryPolicy::none)
    }
}

/// Capabilities for every known kind, with defaults for the rest.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    kinds: BTreeMap<String, KindCapabilities>,
    fallback: KindCapabilities,
}

impl CapabilityTable {
    /// Creates an empty table where every kind gets the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>, capabilities: KindCapabilities) -> Self {
        self.insert(kind, capabilities);
        self
    }

    /// Registers capabilities for a kind.
    pub fn insert(&mut self, kind: impl Into<String>, capabilities: KindCapabilities) {
        self.kinds.insert(kind.into(), capabilities);
    }

    /// Capabilities for a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> &KindCapabilities {
        self.kinds.get(kind).unwrap_or(&self.fallback)
    }

    /// Returns true if the kind has an explicit entry.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Iterates explicit entries in kind order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &KindCapabilities)> {
        self.kinds.iter()
    }
}
