//! S3-based state storage backend.
//!
//! Records live as one JSON object per identity under `<prefix>records/`,
//! so concurrent writes to different resources never clobber each other.
//! A single lock object guards applies.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackwrightError, StateError};
use crate::model::ResourceId;

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{StateSnapshot, StateStore, check_record};
use super::types::StateRecord;

/// Key prefix for record objects.
const RECORDS_PREFIX: &str = "records/";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store using the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn record_key(&self, id: &ResourceId) -> String {
        format!("{}{RECORDS_PREFIX}{id}.json", self.prefix)
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackwrightError::State(StateError::backend(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackwrightError::State(StateError::corrupted(format!("Invalid UTF-8 in S3 object {key}: {e}")))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackwrightError::State(StateError::backend(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackwrightError::State(StateError::backend(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackwrightError::State(StateError::backend(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Lists every record key, following continuation tokens.
    async fn list_record_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{RECORDS_PREFIX}", self.prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StackwrightError::State(StateError::backend(format!("S3 list error: {e}"))))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.ends_with(".json"))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.lock_key()).await? else {
            return Ok(None);
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StackwrightError::State(StateError::corrupted(format!("Failed to parse lock: {e}"))))
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let record_prefix = format!("{}{RECORDS_PREFIX}", self.prefix);
        let mut snapshot = StateSnapshot::new();

        for key in self.list_record_keys().await? {
            let Some(stem) = key
                .strip_prefix(&record_prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let id = ResourceId::parse(stem).map_err(|e| {
                StackwrightError::State(StateError::corrupted(format!("Unexpected object {key}: {e}")))
            })?;

            // Deleted between list and get
            let Some(content) = self.get_object(&key).await? else {
                continue;
            };
            let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
                StackwrightError::State(StateError::corrupted(format!("Failed to parse {key}: {e}")))
            })?;
            check_record(&id, &record)?;
            snapshot.insert(id, record);
        }

        info!(
            "Loaded {} state records from s3://{}/{record_prefix}",
            snapshot.len(),
            self.bucket
        );
        Ok(snapshot)
    }

    async fn save(&self, id: &ResourceId, record: &StateRecord) -> Result<()> {
        let key = self.record_key(id);
        let content = serde_json::to_string_pretty(record).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize {id}: {e}")))
        })?;

        self.put_object(&key, &content).await?;
        debug!("Saved state record to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let key = self.record_key(id);
        self.delete_object(&key).await?;
        debug!("Deleted state record s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
            if !existing.is_expired() {
                return Err(StackwrightError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
        }

        let lock_info = LockInfo::new(holder);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.put_object(&self.lock_key(), &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.lock_key()).await?;
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
        let current = self.read_lock().await?;
        let renewed = match current.as_ref() {
            Some(held) if held.lock_id == lock.lock_id => held.renewed(),
            other => return Err(StateError::lock_lost(&lock.lock_id, other).into()),
        };

        let content = serde_json::to_string_pretty(&renewed).map_err(|e| {
            StackwrightError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.put_object(&self.lock_key(), &content).await?;
        debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
        Ok(renewed)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock().await?.filter(|lock| !lock.is_expired()))
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_object(&self.lock_key()).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks/prod/")), "stacks/prod/");
        assert_eq!(normalize_prefix(Some("/stacks/prod")), "stacks/prod/");
    }
}
