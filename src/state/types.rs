//! Persisted state records.
//!
//! One [`StateRecord`] per resource identity, written as pretty JSON so that
//! state changes read cleanly in a diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::model::ResourceId;

/// Current version of the record format.
pub const STATE_VERSION: &str = "1";

/// Lifecycle status of a recorded resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Provisioned and matching the last applied spec.
    Active,
    /// A provider call for this resource failed; it will be replaced.
    Tainted,
    /// The physical resource is gone.
    Deleted,
}

/// Last-applied snapshot of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    pub version: String,
    /// Resource identity.
    pub identity: ResourceId,
    /// Resource kind (matches the identity's kind).
    pub kind: String,
    /// Last-applied properties, references kept in canonical form.
    pub properties: BTreeMap<String, Value>,
    /// Provider-assigned physical id.
    pub physical_id: Option<String>,
    /// Current status.
    pub status: RecordStatus,
    /// Monotonic revision counter.
    pub revision: u64,
    /// Dependencies at the time of the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Output attributes returned by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Physical ids of replaced instances whose deletion failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl RecordStatus {
    /// Returns true if the record still describes a live resource.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Active => "active",
            Self::Tainted => "tainted",
            Self::Deleted => "deleted",
        };
        write!(f, "{status}")
    }
}

impl StateRecord {
    /// Creates a new active record at revision 1.
    #[must_use]
    pub fn new(identity: ResourceId, properties: BTreeMap<String, Value>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            kind: identity.kind().to_string(),
            identity,
            properties,
            physical_id: None,
            status: RecordStatus::Active,
            revision: 1,
            dependencies: BTreeSet::new(),
            outputs: BTreeMap::new(),
            deposed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Sets the status and bumps `updated_at`.
    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Looks up an attribute for reference resolution.
    ///
    /// `id` is the physical id; everything else comes from outputs.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return self.physical_id.clone().map(Value::String);
        }
        self.outputs.get(name).cloned()
    }

    /// Returns true if the record is tainted.
    #[must_use]
    pub fn is_tainted(&self) -> bool {
        self.status == RecordStatus::Tainted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> StateRecord {
        let id = ResourceId::new("database", "main").expect("valid");
        let mut record = StateRecord::new(id, BTreeMap::from([(String::from("engine"), json!("postgres"))]));
        record.physical_id = Some(String::from("db-1234"));
        record
            .outputs
            .insert(String::from("endpoint"), json!("db.internal:5432"));
        record
    }

    #[test]
    fn test_attribute_lookup() {
        let record = record();
        assert_eq!(record.attribute("id"), Some(json!("db-1234")));
        assert_eq!(record.attribute("endpoint"), Some(json!("db.internal:5432")));
        assert_eq!(record.attribute("arn"), None);
    }

    #[test]
    fn test_record_json_shape() {
        let value = serde_json::to_value(record()).expect("serialize");
        assert_eq!(value["identity"], json!("database.main"));
        assert_eq!(value["kind"], json!("database"));
        assert_eq!(value["status"], json!("active"));
        assert_eq!(value["revision"], json!(1));
        assert!(value.get("deposed").is_none());

        let back: StateRecord = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, record_with_time(&back));
    }

    fn record_with_time(other: &StateRecord) -> StateRecord {
        let mut expected = record();
        expected.updated_at = other.updated_at;
        expected
    }

    #[test]
    fn test_status_liveness() {
        assert!(RecordStatus::Active.is_live());
        assert!(RecordStatus::Tainted.is_live());
        assert!(!RecordStatus::Deleted.is_live());
    }
}
