//! Local simulated cloud.
//!
//! The sandbox assigns physical ids, echoes properties back as outputs and
//! optionally persists its inventory to a JSON file so that successive CLI
//! runs see the same "cloud". Faults and latency can be injected to rehearse
//! failure handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::traits::{Provider, ProviderOp, Provisioned, ResourceRequest};
use crate::error::ProviderError;
use crate::model::ResourceId;
use crate::state::StateRecord;

/// A physical resource living in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResource {
    /// Identity the resource was created for.
    pub identity: ResourceId,
    /// Current properties.
    pub properties: BTreeMap<String, Value>,
}

/// One provider call, as observed by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCall {
    /// Operation.
    pub op: ProviderOp,
    /// Resource the call was for.
    pub id: ResourceId,
}

#[derive(Debug, Clone)]
struct Fault {
    error: ProviderError,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, SandboxResource>,
    faults: BTreeMap<(ResourceId, ProviderOp), Fault>,
    calls: Vec<SandboxCall>,
}

/// Simulated provider.
#[derive(Debug, Default)]
pub struct SandboxProvider {
    inner: Mutex<Inner>,
    inventory_path: Option<PathBuf>,
    latency: Option<Duration>,
}

impl SandboxProvider {
    /// Creates an in-memory sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sandbox whose inventory is persisted to `path`.
    #[must_use]
    pub fn with_inventory(path: impl Into<PathBuf>) -> Self {
        Self {
            inventory_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every `op` on `id` fail with `error`.
    pub async fn fail_on(&self, id: &ResourceId, op: ProviderOp, error: ProviderError) {
        self.inner.lock().await.faults.insert(
            (id.clone(), op),
            Fault {
                error,
                remaining: None,
            },
        );
    }

    /// Makes the next `times` calls of `op` on `id` fail with `error`.
    pub async fn fail_times(&self, id: &ResourceId, op: ProviderOp, error: ProviderError, times: u32) {
        self.inner.lock().await.faults.insert(
            (id.clone(), op),
            Fault {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Removes every injected fault.
    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults.clear();
    }

    /// Calls observed so far, in order.
    pub async fn calls(&self) -> Vec<SandboxCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Current inventory, keyed by physical id.
    ///
    /// # Errors
    ///
    /// Returns an error if a persisted inventory cannot be read.
    pub async fn resources(&self) -> Result<BTreeMap<String, SandboxResource>, ProviderError> {
        let mut inner = self.inner.lock().await;
        self.load_inventory(&mut inner).await?;
        Ok(inner.resources.clone())
    }

    async fn load_inventory(&self, inner: &mut Inner) -> Result<(), ProviderError> {
        let Some(path) = &self.inventory_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to read sandbox inventory {}: {e}", path.display()),
            }
        })?;
        inner.resources = serde_json::from_str(&content).map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse sandbox inventory {}: {e}", path.display()),
        })?;
        Ok(())
    }

    async fn store_inventory(&self, inner: &Inner) -> Result<(), ProviderError> {
        let Some(path) = &self.inventory_path else {
            return Ok(());
        };

        let failed = |e: String| ProviderError::InvalidResponse {
            message: format!("Failed to write sandbox inventory {}: {e}", path.display()),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(&inner.resources).map_err(|e| failed(e.to_string()))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| failed(e.to_string()))
    }

    /// Records the call, applies latency and returns any injected fault.
    async fn enter(&self, inner: &mut Inner, id: &ResourceId, op: ProviderOp) -> Result<(), ProviderError> {
        inner.calls.push(SandboxCall { op, id: id.clone() });
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = (id.clone(), op);
        let Some(fault) = inner.faults.get_mut(&key) else {
            return Ok(());
        };
        let error = fault.error.clone();
        let exhausted = match &mut fault.remaining {
            None => false,
            Some(left) => {
                *left = left.saturating_sub(1);
                *left == 0
            }
        };
        if exhausted {
            inner.faults.remove(&key);
        }

        debug!("Sandbox injecting {op} failure for {id}: {error}");
        Err(error)
    }

    fn outputs(id: &ResourceId, physical_id: &str, properties: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut outputs = properties.clone();
        outputs.insert(String::from("id"), Value::String(physical_id.to_string()));
        outputs.insert(
            String::from("arn"),
            Value::String(format!("sandbox:{}:{physical_id}", id.kind())),
        );
        outputs.insert(
            String::from("endpoint"),
            Value::String(format!("{physical_id}.{}.sandbox.local", id.kind())),
        );
        outputs
    }
}

#[async_trait]
impl Provider for SandboxProvider {
    async fn create(&self, request: &ResourceRequest) -> Result<Provisioned, ProviderError> {
        let mut inner = self.inner.lock().await;
        self.load_inventory(&mut inner).await?;
        self.enter(&mut inner, &request.id, ProviderOp::Create).await?;

        let uuid = Uuid::new_v4().simple().to_string();
        let physical_id = format!("{}-{}", request.id.kind(), &uuid[..8]);
        inner.resources.insert(
            physical_id.clone(),
            SandboxResource {
                identity: request.id.clone(),
                properties: request.properties.clone(),
            },
        );
        self.store_inventory(&inner).await?;

        trace!("Sandbox created {physical_id} for {}", request.id);
        Ok(Provisioned {
            outputs: Self::outputs(&request.id, &physical_id, &request.properties),
            physical_id,
        })
    }

    async fn update(
        &self,
        request: &ResourceRequest,
        previous: &StateRecord,
    ) -> Result<Provisioned, ProviderError> {
        let mut inner = self.inner.lock().await;
        self.load_inventory(&mut inner).await?;
        self.enter(&mut inner, &request.id, ProviderOp::Update).await?;

        let physical_id = previous.physical_id.clone().unwrap_or_default();
        let Some(resource) = inner.resources.get_mut(&physical_id) else {
            return Err(ProviderError::NotFound { physical_id });
        };
        resource.properties.clone_from(&request.properties);
        self.store_inventory(&inner).await?;

        trace!("Sandbox updated {physical_id} for {}", request.id);
        Ok(Provisioned {
            outputs: Self::outputs(&request.id, &physical_id, &request.properties),
            physical_id,
        })
    }

    async fn delete(&self, previous: &StateRecord) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        self.load_inventory(&mut inner).await?;
        self.enter(&mut inner, &previous.identity, ProviderOp::Delete).await?;

        let physical_id = previous.physical_id.clone().unwrap_or_default();
        if inner.resources.remove(&physical_id).is_none() {
            return Err(ProviderError::NotFound { physical_id });
        }
        self.store_inventory(&inner).await?;

        trace!("Sandbox deleted {physical_id} for {}", previous.identity);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sandbox"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn request(s: &str) -> ResourceRequest {
        ResourceRequest {
            id: ResourceId::parse(s).expect("valid"),
            properties: BTreeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
        }
    }

    fn record_for(request: &ResourceRequest, provisioned: &Provisioned) -> StateRecord {
        let mut record = StateRecord::new(request.id.clone(), request.properties.clone());
        record.physical_id = Some(provisioned.physical_id.clone());
        record
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let sandbox = SandboxProvider::new();
        let vpc = request("network.vpc");

        let created = sandbox.create(&vpc).await.expect("create");
        assert!(created.physical_id.starts_with("network-"));
        assert_eq!(created.outputs["cidr"], json!("10.0.0.0/16"));
        assert_eq!(created.outputs["id"], json!(created.physical_id));

        let record = record_for(&vpc, &created);
        let mut changed = vpc.clone();
        changed.properties.insert(String::from("cidr"), json!("10.1.0.0/16"));
        let updated = sandbox.update(&changed, &record).await.expect("update");
        assert_eq!(updated.physical_id, created.physical_id);

        sandbox.delete(&record).await.expect("delete");
        let again = sandbox.delete(&record).await;
        assert!(matches!(again, Err(ProviderError::NotFound { .. })));

        let ops: Vec<ProviderOp> = sandbox.calls().await.into_iter().map(|c| c.op).collect();
        assert_eq!(
            ops,
            [ProviderOp::Create, ProviderOp::Update, ProviderOp::Delete, ProviderOp::Delete]
        );
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let sandbox = SandboxProvider::new();
        let vpc = request("network.vpc");
        sandbox
            .fail_times(&vpc.id, ProviderOp::Create, ProviderError::network("reset"), 2)
            .await;

        assert!(sandbox.create(&vpc).await.is_err());
        assert!(sandbox.create(&vpc).await.is_err());
        sandbox.create(&vpc).await.expect("third call succeeds");
    }

    #[tokio::test]
    async fn test_persistent_fault_until_cleared() {
        let sandbox = SandboxProvider::new();
        let vpc = request("network.vpc");
        sandbox
            .fail_on(&vpc.id, ProviderOp::Create, ProviderError::api("create", 400, "quota", false))
            .await;

        for _ in 0..3 {
            assert!(sandbox.create(&vpc).await.is_err());
        }
        sandbox.clear_faults().await;
        sandbox.create(&vpc).await.expect("create after clearing");
    }

    #[tokio::test]
    async fn test_inventory_survives_restart() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("sandbox.json");
        let vpc = request("network.vpc");

        let created = SandboxProvider::with_inventory(&path)
            .create(&vpc)
            .await
            .expect("create");

        let reopened = SandboxProvider::with_inventory(&path);
        let resources = reopened.resources().await.expect("inventory");
        assert_eq!(resources[&created.physical_id].identity, vpc.id);

        reopened
            .delete(&record_for(&vpc, &created))
            .await
            .expect("delete through a new instance");
        assert!(reopened.resources().await.expect("inventory").is_empty());
    }
}
