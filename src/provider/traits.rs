//! Provider interface consumed by the executor.
//!
//! A provider turns resolved resource requests into physical resources. It
//! knows nothing about graphs, plans or state files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::model::ResourceId;
use crate::state::StateRecord;

/// Provider operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOp {
    /// Create a new physical resource.
    Create,
    /// Update an existing physical resource in place.
    Update,
    /// Delete a physical resource.
    Delete,
}

impl std::fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{op}")
    }
}

/// A resource with every reference replaced by a concrete value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRequest {
    /// Resource identity.
    pub id: ResourceId,
    /// Resolved properties.
    pub properties: BTreeMap<String, Value>,
}

/// What a provider returns after creating or updating a resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Provisioned {
    /// Provider-assigned physical id.
    pub physical_id: String,
    /// Output attributes other resources may reference.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Cloud provider adapter.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a physical resource.
    async fn create(&self, request: &ResourceRequest) -> Result<Provisioned, ProviderError>;

    /// Updates a physical resource in place.
    async fn update(
        &self,
        request: &ResourceRequest,
        previous: &StateRecord,
    ) -> Result<Provisioned, ProviderError>;

    /// Deletes the physical resource described by `previous`.
    async fn delete(&self, previous: &StateRecord) -> Result<(), ProviderError>;

    /// Short provider name for logs and output.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl Provider for Box<dyn Provider> {
    async fn create(&self, request: &ResourceRequest) -> Result<Provisioned, ProviderError> {
        (**self).create(request).await
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        previous: &StateRecord,
    ) -> Result<Provisioned, ProviderError> {
        (**self).update(request, previous).await
    }

    async fn delete(&self, previous: &StateRecord) -> Result<(), ProviderError> {
        (**self).delete(previous).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
