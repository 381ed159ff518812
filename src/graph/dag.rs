//! Identity-level dependency graph backed by petgraph.
//!
//! Edges point from a dependency to its dependents, so Kahn's algorithm walks
//! outgoing edges as nodes are placed. Ready nodes are taken in identity
//! order, which makes every sort reproducible.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::ResourceId;

/// Result of a topological sort: the sorted prefix and the nodes left over.
pub(crate) struct Sorted {
    pub order: Vec<ResourceId>,
    pub remaining: BTreeSet<ResourceId>,
}

/// One concrete cycle plus every node lying on any cycle.
pub(crate) struct Cycle {
    pub path: Vec<ResourceId>,
    pub members: Vec<ResourceId>,
}

/// Directed graph over identities.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdentityGraph {
    graph: DiGraph<ResourceId, ()>,
    index: BTreeMap<ResourceId, NodeIndex>,
}

impl IdentityGraph {
    /// Builds the graph from `id -> dependencies`.
    ///
    /// Dependencies that are not keys of `edges` are ignored.
    pub(crate) fn from_dependencies(edges: &BTreeMap<ResourceId, BTreeSet<ResourceId>>) -> Self {
        let edge_total = edges.values().map(BTreeSet::len).sum();
        let mut graph = DiGraph::with_capacity(edges.len(), edge_total);
        let index: BTreeMap<ResourceId, NodeIndex> = edges
            .keys()
            .map(|id| (id.clone(), graph.add_node(id.clone())))
            .collect();

        for (id, deps) in edges {
            let Some(&dependent) = index.get(id) else {
                continue;
            };
            for dep in deps {
                if let Some(&dependency) = index.get(dep) {
                    graph.add_edge(dependency, dependent, ());
                }
            }
        }

        Self { graph, index }
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct dependents of `id`, in identity order.
    pub(crate) fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut dependents: Vec<&ResourceId> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n))
            .collect();
        dependents.sort();
        dependents
    }

    /// Kahn's algorithm. Nodes on or behind a cycle end up in `remaining`.
    pub(crate) fn sort(&self) -> Sorted {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BTreeSet<(&ResourceId, NodeIndex)> = self
            .graph
            .node_indices()
            .filter(|n| in_degree.get(n.index()) == Some(&0))
            .filter_map(|n| self.graph.node_weight(n).map(|id| (id, n)))
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some((id, node)) = ready.pop_first() {
            order.push(id.clone());
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let Some(count) = in_degree.get_mut(dependent.index()) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count == 0
                    && let Some(dependent_id) = self.graph.node_weight(dependent)
                {
                    ready.insert((dependent_id, dependent));
                }
            }
        }

        let remaining = self
            .graph
            .node_indices()
            .filter(|n| in_degree.get(n.index()).is_some_and(|count| *count > 0))
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();

        Sorted { order, remaining }
    }

    /// Finds the cycles, if any, with one strongly connected component pass.
    pub(crate) fn find_cycle(&self) -> Option<Cycle> {
        let components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || component.first().is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .collect();

        let mut members: Vec<ResourceId> = components
            .iter()
            .flatten()
            .filter_map(|&n| self.graph.node_weight(n).cloned())
            .collect();
        members.sort();

        // Walk from the smallest member along its smallest dependency in the
        // same component until a node repeats; the repeated stretch is the path.
        let start = *self.index.get(members.first()?)?;
        let within: BTreeSet<NodeIndex> = components
            .iter()
            .find(|component| component.contains(&start))?
            .iter()
            .copied()
            .collect();

        let mut walk: Vec<NodeIndex> = Vec::new();
        let mut current = start;
        loop {
            if let Some(seen) = walk.iter().position(|&n| n == current) {
                walk = walk.split_off(seen);
                walk.push(current);
                break;
            }
            walk.push(current);
            current = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| within.contains(n))
                .filter_map(|n| self.graph.node_weight(n).map(|id| (id, n)))
                .min()
                .map(|(_, n)| n)?;
        }

        let path = walk
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        Some(Cycle { path, members })
    }
}

/// Sorts `id -> dependencies` with Kahn's algorithm, ready nodes in identity order.
///
/// Dependencies that are not keys of `edges` are ignored.
pub(crate) fn topological_sort(edges: &BTreeMap<ResourceId, BTreeSet<ResourceId>>) -> Sorted {
    IdentityGraph::from_dependencies(edges).sort()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).expect("valid identity")
    }

    /// `(identity, comma-separated dependencies)` pairs.
    fn edges(pairs: &[(&str, &str)]) -> BTreeMap<ResourceId, BTreeSet<ResourceId>> {
        pairs
            .iter()
            .map(|(node, deps)| {
                let deps = deps.split(',').filter(|dep| !dep.is_empty()).map(id).collect();
                (id(node), deps)
            })
            .collect()
    }

    fn rendered(ids: &[ResourceId]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_ready_nodes_sorted_by_identity() {
        let forward = edges(&[("app.web", "db.main"), ("db.main", ""), ("cache.redis", "")]);
        let sorted = topological_sort(&forward);
        assert_eq!(rendered(&sorted.order), ["cache.redis", "db.main", "app.web"]);
        assert!(sorted.remaining.is_empty());
    }

    #[test]
    fn test_unknown_dependencies_are_ignored() {
        let sorted = topological_sort(&edges(&[("app.web", "db.gone")]));
        assert_eq!(rendered(&sorted.order), ["app.web"]);
    }

    #[test]
    fn test_nodes_behind_a_cycle_remain() {
        let dag = IdentityGraph::from_dependencies(&edges(&[
            ("a.one", "a.two"),
            ("a.two", "a.one"),
            ("b.tail", "a.one"),
            ("c.free", ""),
        ]));

        let sorted = dag.sort();
        assert_eq!(rendered(&sorted.order), ["c.free"]);
        assert_eq!(sorted.remaining.len(), 3);

        // b.tail waits on the cycle but is not part of it
        let cycle = dag.find_cycle().expect("cycle");
        assert_eq!(rendered(&cycle.members), ["a.one", "a.two"]);
        assert_eq!(rendered(&cycle.path), ["a.one", "a.two", "a.one"]);
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        let dag = IdentityGraph::from_dependencies(&edges(&[("a.one", ""), ("a.two", "a.one")]));
        assert!(dag.find_cycle().is_none());
        assert_eq!(dag.edge_count(), 1);
    }

    #[test]
    fn test_dependents_in_identity_order() {
        let dag = IdentityGraph::from_dependencies(&edges(&[
            ("network.vpc", ""),
            ("service.api", "network.vpc"),
            ("database.main", "network.vpc"),
        ]));
        let dependents: Vec<String> = dag
            .dependents(&id("network.vpc"))
            .into_iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(dependents, ["database.main", "service.api"]);
        assert!(dag.dependents(&id("service.api")).is_empty());
    }
}
