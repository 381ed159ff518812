//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::lock::LockInfo;
use super::types::StateRecord;
use crate::error::Result;
use crate::model::ResourceId;

/// Snapshot of every recorded resource, keyed by identity.
pub type StateSnapshot = BTreeMap<ResourceId, StateRecord>;

/// Trait for state storage backends.
///
/// Writes are atomic per identity and visible to the next `load`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every record.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Saves the record for one identity.
    async fn save(&self, id: &ResourceId, record: &StateRecord) -> Result<()>;

    /// Removes the record for one identity. Missing records are not an error.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends a lock this process holds.
    ///
    /// Fails with `LockLost` if the stored lock is gone or belongs to
    /// someone else, for instance after it expired and was taken over.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<StateSnapshot> {
        (**self).load().await
    }

    async fn save(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        (**self).save(id, record).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        (**self).delete(id).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Checks that a loaded record is stored under its own identity.
pub(crate) fn check_record(id: &ResourceId, record: &StateRecord) -> Result<()> {
    if record.identity != *id || record.kind != id.kind() {
        return Err(crate::error::StateError::corrupted(format!(
            "record stored as {id} describes {} (kind {})",
            record.identity, record.kind
        ))
        .into());
    }
    if record.version != super::types::STATE_VERSION {
        return Err(crate::error::StateError::VersionMismatch {
            expected: super::types::STATE_VERSION.to_string(),
            found: record.version.clone(),
        }
        .into());
    }
    Ok(())
}
