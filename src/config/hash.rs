//! Fingerprints for change detection.
//!
//! Plans carry a fingerprint of the desired graph and of the prior state
//! they were computed against. The executor re-fingerprints the state before
//! applying and refuses to run a plan whose prior state has moved on.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::graph::DependencyGraph;
use crate::state::StateSnapshot;

/// Hasher for computing deterministic fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fingerprints a desired graph: identities, properties and edges, in rank order.
    #[must_use]
    pub fn hash_graph(&self, graph: &DependencyGraph) -> String {
        let mut hasher = Sha256::new();

        for node in graph.iter() {
            hasher.update(node.spec.id().to_string().as_bytes());
            hasher.update(self.hash_properties(&node.spec.canonical_properties()).as_bytes());
            for dep in &node.dependencies {
                hasher.update(b"->");
                hasher.update(dep.to_string().as_bytes());
            }
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Fingerprints a state snapshot.
    ///
    /// Only the fields that change when an op is applied are included, so
    /// re-reading unchanged records gives the same fingerprint.
    #[must_use]
    pub fn hash_state(&self, snapshot: &StateSnapshot) -> String {
        let mut hasher = Sha256::new();

        for (id, record) in snapshot {
            hasher.update(id.to_string().as_bytes());
            hasher.update(record.revision.to_be_bytes());
            hasher.update(record.status.to_string().as_bytes());
            hasher.update(record.physical_id.as_deref().unwrap_or("").as_bytes());
            for deposed in &record.deposed {
                hasher.update(deposed.as_bytes());
            }
            hasher.update(self.hash_properties(&record.properties).as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Fingerprints a property map in its canonical JSON form.
    #[must_use]
    pub fn hash_properties(&self, properties: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();

        // BTreeMap and serde_json's default map both iterate in key order
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{ResourceId, SpecSet};
    use crate::state::{RecordStatus, StateRecord};
    use serde_json::json;

    fn graph(cidr: &str) -> DependencyGraph {
        let mut specs = SpecSet::new();
        specs
            .define_resource(
                "network",
                "vpc",
                &BTreeMap::from([(String::from("cidr"), json!(cidr))]),
                [],
            )
            .expect("vpc");
        GraphBuilder::build(&specs).expect("graph")
    }

    #[test]
    fn test_graph_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_graph(&graph("10.0.0.0/16")), hasher.hash_graph(&graph("10.0.0.0/16")));
        assert_ne!(hasher.hash_graph(&graph("10.0.0.0/16")), hasher.hash_graph(&graph("10.1.0.0/16")));
    }

    #[test]
    fn test_state_hash_tracks_revision_and_status() {
        let hasher = ConfigHasher::new();
        let id = ResourceId::new("network", "vpc").expect("valid");
        let record = StateRecord::new(id.clone(), BTreeMap::new());
        let snapshot = StateSnapshot::from([(id.clone(), record.clone())]);
        let before = hasher.hash_state(&snapshot);

        let mut touched = record.clone();
        touched.updated_at = chrono::Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(before, hasher.hash_state(&StateSnapshot::from([(id.clone(), touched)])));

        let mut bumped = record.clone();
        bumped.revision += 1;
        assert_ne!(before, hasher.hash_state(&StateSnapshot::from([(id.clone(), bumped)])));

        let mut tainted = record;
        tainted.status = RecordStatus::Tainted;
        assert_ne!(before, hasher.hash_state(&StateSnapshot::from([(id, tainted)])));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
