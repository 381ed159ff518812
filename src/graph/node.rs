//! Graph nodes and the built dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use super::dag::IdentityGraph;
use crate::model::{ResourceId, ResourceSpec};

/// A resource spec placed in the graph.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// The desired spec.
    pub spec: ResourceSpec,
    /// Resolved dependency edges (references and explicit deps).
    pub dependencies: BTreeSet<ResourceId>,
    /// Position in the topological order. Dependencies always rank lower.
    pub rank: usize,
}

/// Acyclic, closed dependency graph of one stack.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceId, ResourceNode>,
    order: Vec<ResourceId>,
    dag: IdentityGraph,
}

impl DependencyGraph {
    pub(crate) const fn from_parts(
        nodes: BTreeMap<ResourceId, ResourceNode>,
        order: Vec<ResourceId>,
        dag: IdentityGraph,
    ) -> Self {
        Self { nodes, order, dag }
    }

    /// Looks up a node.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the identity is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Rank of a node.
    #[must_use]
    pub fn rank(&self, id: &ResourceId) -> Option<usize> {
        self.nodes.get(id).map(|node| node.rank)
    }

    /// Nodes in ascending rank (dependencies first).
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Identities in ascending rank.
    #[must_use]
    pub fn order(&self) -> &[ResourceId] {
        &self.order
    }

    /// Nodes that depend directly on `id`, in identity order.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.dag.dependents(id)
    }

    /// Total number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
