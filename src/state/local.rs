//! Local file-based state storage backend.
//!
//! Each resource gets its own pretty-printed JSON file under
//! `.stackwright/records/`, named after its identity. Writes go to a temp
//! file first and are renamed into place, so a record is either the old
//! version or the new one, never a torn mix.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackwrightError, StateError};
use crate::model::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{StateSnapshot, StateStore, check_record};
use super::types::StateRecord;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// Directory holding one file per record.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding record files.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a local state store under `.stackwright` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackwrightError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
        }
    }

    /// Base directory of this store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: &ResourceId) -> PathBuf {
        self.records_dir.join(format!("{id}.json"))
    }

    /// Ensures the records directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.records_dir.exists() {
            debug!("Creating state directory: {}", self.records_dir.display());
            fs::create_dir_all(&self.records_dir).await.map_err(|e| {
                StackwrightError::State(StateError::backend(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_record(&self, path: &Path) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!(
                "Failed to read {}: {e}",
                path.display()
            )))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!(
                "Failed to parse {}: {e}",
                path.display()
            )))
        })
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to read lock file: {e}")))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackwrightError::State(StateError::corrupted(format!("Failed to parse lock file: {e}")))
        })?;

        Ok(Some(lock_info))
    }

    /// Writes `content` to `path` through a temp file and a rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("json.tmp");
        let failed = |step: &str, e: std::io::Error| {
            StackwrightError::State(StateError::backend(format!(
                "Failed to {step} {}: {e}",
                path.display()
            )))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| failed("create temp file for", e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| failed("write", e))?;
        file.sync_all().await.map_err(|e| failed("sync", e))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| failed("rename temp file onto", e))?;
        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StackwrightError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();
        if !self.records_dir.exists() {
            debug!("No state directory at {}", self.records_dir.display());
            return Ok(snapshot);
        }

        let mut entries = fs::read_dir(&self.records_dir).await.map_err(|e| {
            StackwrightError::State(StateError::backend(format!("Failed to list state records: {e}")))
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StackwrightError::State(StateError::backend(format!("Failed to list state records: {e}")))
        })? {
            let path = entry.path();
            let Some(stem) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };

            let id = ResourceId::parse(stem).map_err(|e| {
                StackwrightError::State(StateError::corrupted(format!(
                    "Unexpected file {} in state directory: {e}",
                    path.display()
                )))
            })?;
            let record = self.read_record(&path).await?;
            check_record(&id, &record)?;
            snapshot.insert(id, record);
        }

        debug!("Loaded {} state records from {}", snapshot.len(), self.records_dir.display());
        Ok(snapshot)
    }

    async fn save(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(record).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize {id}: {e}")))
        })?;

        Self::write_atomic(&self.record_path(id), &content).await?;
        debug!("Saved state record {id} (revision {})", record.revision);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                StackwrightError::State(StateError::backend(format!(
                    "Failed to delete {}: {e}",
                    path.display()
                )))
            })?;
            debug!("Deleted state record {id}");
        }
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackwrightError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackwrightError::State(StateError::LockFailed {
                    message: format!("Failed to create state directory: {e}"),
                })
            })?;
        }

        let lock_info = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        Self::write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let current = self.read_lock_file().await?;
        let renewed = match current.as_ref() {
            Some(held) if held.lock_id == lock.lock_id => held.renewed(),
            other => return Err(StateError::lock_lost(&lock.lock_id, other).into()),
        };

        let content = serde_json::to_string_pretty(&renewed).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        Self::write_atomic(&self.lock_path, &content).await?;
        debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
        Ok(renewed)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self
            .read_lock_file()
            .await?
            .filter(|lock| !lock.is_expired()))
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
