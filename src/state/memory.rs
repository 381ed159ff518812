//! In-process state backend.
//!
//! Used for dry runs and tests. Write failures can be injected to rehearse
//! the executor's state-write retry path.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, StackwrightError, StateError};
use crate::model::ResourceId;

use super::lock::LockInfo;
use super::store::{StateSnapshot, StateStore};
use super::types::StateRecord;

/// Memory-backed state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<StateSnapshot>,
    lock: Mutex<Option<LockInfo>>,
    failing_saves: AtomicU32,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let snapshot = records
            .into_iter()
            .map(|record| (record.identity.clone(), record))
            .collect();
        Self {
            records: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Makes the next `count` saves fail with a backend error.
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Replaces whatever lock is held with a fresh one for `holder`, the way
    /// another process takes over an expired lock.
    ///
    /// # Errors
    ///
    /// Returns `LockFailed` if the lock slot is busy.
    pub fn take_over_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut slot = self.lock.try_lock().map_err(|e| {
            StackwrightError::State(StateError::LockFailed {
                message: format!("lock slot busy: {e}"),
            })
        })?;
        let info = LockInfo::new(holder);
        *slot = Some(info.clone());
        Ok(info)
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        Ok(self.records.read().await.clone())
    }

    async fn save(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        let injected = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            debug!("Injected save failure for {id}");
            return Err(StackwrightError::State(StateError::backend(format!(
                "injected write failure for {id}"
            ))));
        }

        self.records.write().await.insert(id.clone(), record.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        if let Some(existing) = slot.as_ref().filter(|lock| !lock.is_expired()) {
            return Err(StackwrightError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let info = LockInfo::new(holder);
        *slot = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut slot = self.lock.lock().await;
        if slot.as_ref().is_some_and(|lock| lock.lock_id == lock_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut slot = self.lock.lock().await;
        let renewed = match slot.as_ref() {
            Some(held) if held.lock_id == lock.lock_id => held.renewed(),
            other => return Err(StateError::lock_lost(&lock.lock_id, other).into()),
        };
        *slot = Some(renewed.clone());
        Ok(renewed)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self
            .lock
            .lock()
            .await
            .clone()
            .filter(|lock| !lock.is_expired()))
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(s: &str) -> StateRecord {
        StateRecord::new(ResourceId::parse(s).expect("valid"), BTreeMap::new())
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let store = MemoryStateStore::new();
        let vpc = record("network.vpc");
        store.save(&vpc.identity, &vpc).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.get(&vpc.identity), Some(&vpc));
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStateStore::new();
        let vpc = record("network.vpc");
        store.fail_next_saves(2);

        assert!(store.save(&vpc.identity, &vpc).await.is_err());
        assert!(store.save(&vpc.identity, &vpc).await.is_err());
        store.save(&vpc.identity, &vpc).await.expect("third save succeeds");
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStateStore::with_records([record("network.vpc")]);
        let lock = store.acquire_lock("one").await.expect("first lock");
        assert!(store.acquire_lock("two").await.is_err());

        store.release_lock("not-the-lock").await.expect("release");
        assert!(store.lock_info().await.expect("info").is_some());

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.lock_info().await.expect("info").is_none());
        assert_eq!(store.load().await.expect("load").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_fails_after_takeover() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("one").await.expect("lock");
        let renewed = store.refresh_lock(&lock).await.expect("refresh");
        assert_eq!(renewed.lock_id, lock.lock_id);

        store.take_over_lock("two").expect("take over");
        let err = store.refresh_lock(&lock).await.expect_err("lost");
        assert!(matches!(
            err,
            StackwrightError::State(StateError::LockLost { ref holder, .. }) if holder == "two"
        ));
        assert_eq!(store.lock_info().await.expect("info").map(|l| l.holder), Some(String::from("two")));
    }
}
