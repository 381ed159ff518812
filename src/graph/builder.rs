//! Dependency graph construction.
//!
//! Edges come from reference pointers found in properties plus the explicit
//! `depends_on` list. Ranks are the positions in a Kahn sort that breaks ties
//! by identity, so the same specs always produce the same order.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::dag::{Cycle, IdentityGraph};
use super::node::{DependencyGraph, ResourceNode};
use crate::error::GraphError;
use crate::model::{ResourceId, SpecSet};

/// Builds dependency graphs from spec sets.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Builds the graph for a spec set.
    ///
    /// # Errors
    ///
    /// Returns `DanglingReference` for the first undeclared dependency in
    /// identity order, or `Cycle` if the dependency relation is cyclic.
    pub fn build(specs: &SpecSet) -> Result<DependencyGraph, GraphError> {
        let mut edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = BTreeMap::new();

        for spec in specs.iter() {
            let mut deps = BTreeSet::new();

            for (path, reference) in spec.references() {
                if specs.get(&reference.target).is_none() {
                    return Err(GraphError::DanglingReference {
                        from: spec.id().clone(),
                        missing: reference.target.clone(),
                        via: path,
                    });
                }
                deps.insert(reference.target.clone());
            }

            for explicit in spec.explicit_dependencies() {
                if specs.get(explicit).is_none() {
                    return Err(GraphError::DanglingReference {
                        from: spec.id().clone(),
                        missing: explicit.clone(),
                        via: String::from("depends_on"),
                    });
                }
                deps.insert(explicit.clone());
            }

            edges.insert(spec.id().clone(), deps);
        }

        let dag = IdentityGraph::from_dependencies(&edges);
        let sorted = dag.sort();
        if !sorted.remaining.is_empty() {
            let Cycle { path, members } = dag.find_cycle().unwrap_or_else(|| Cycle {
                path: Vec::new(),
                members: sorted.remaining.into_iter().collect(),
            });
            return Err(GraphError::Cycle { path, members });
        }

        let mut nodes = BTreeMap::new();
        for (rank, id) in sorted.order.iter().enumerate() {
            let (Some(spec), Some(deps)) = (specs.get(id), edges.remove(id)) else {
                continue;
            };
            nodes.insert(
                id.clone(),
                ResourceNode {
                    spec: spec.clone(),
                    dependencies: deps,
                    rank,
                },
            );
        }

        debug!("Built dependency graph with {} nodes and {} edges", nodes.len(), dag.edge_count());
        Ok(DependencyGraph::from_parts(nodes, sorted.order, dag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).expect("object")
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).expect("valid identity")
    }

    fn rendered(ids: &[ResourceId]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_reference_creates_edge() {
        let mut specs = SpecSet::new();
        specs
            .define_resource("network", "a", &BTreeMap::new(), [])
            .expect("a");
        specs
            .define_resource("network", "b", &props(json!({"x": "${network.a.id}"})), [])
            .expect("b");
        specs
            .define_resource("network", "c", &props(json!({"y": "${network.b.id}"})), [])
            .expect("c");

        let graph = GraphBuilder::build(&specs).expect("acyclic");
        assert_eq!(rendered(graph.order()), ["network.a", "network.b", "network.c"]);
        assert!(graph.get(&id("network.b")).expect("b").dependencies.contains(&id("network.a")));
        assert_eq!(graph.dependents(&id("network.a")), [&id("network.b")]);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_dependencies_rank_lower() {
        let mut specs = SpecSet::new();
        specs
            .define_resource("service", "api", &props(json!({"db": "${database.main.endpoint}"})), ["cluster.main"])
            .expect("api");
        specs
            .define_resource("cluster", "main", &props(json!({"vpc": {"$ref": "network.vpc.id"}})), [])
            .expect("cluster");
        specs
            .define_resource("database", "main", &props(json!({"vpc": "${network.vpc.id}"})), [])
            .expect("db");
        specs
            .define_resource("network", "vpc", &BTreeMap::new(), [])
            .expect("vpc");

        let graph = GraphBuilder::build(&specs).expect("acyclic");
        for node in graph.iter() {
            for dep in &node.dependencies {
                assert!(graph.rank(dep).expect("dep") < node.rank);
            }
        }
        assert_eq!(
            rendered(graph.order()),
            ["network.vpc", "cluster.main", "database.main", "service.api"]
        );
    }

    #[test]
    fn test_unrelated_nodes_ordered_by_identity() {
        let mut specs = SpecSet::new();
        for name in ["zeta", "alpha", "mid"] {
            specs
                .define_resource("bucket", name, &BTreeMap::new(), [])
                .expect("bucket");
        }

        let first = GraphBuilder::build(&specs).expect("graph");
        let second = GraphBuilder::build(&specs).expect("graph");
        assert_eq!(rendered(first.order()), ["bucket.alpha", "bucket.mid", "bucket.zeta"]);
        assert_eq!(first.order(), second.order());
    }

    #[test]
    fn test_cycle_reports_path_and_members() {
        let mut specs = SpecSet::new();
        specs
            .define_resource("a", "x", &props(json!({"p": "${b.y.id}"})), [])
            .expect("a");
        specs
            .define_resource("b", "y", &props(json!({"p": "${a.x.id}"})), [])
            .expect("b");
        specs
            .define_resource("c", "z", &props(json!({"p": "${a.x.id}"})), [])
            .expect("c");

        let err = GraphBuilder::build(&specs).expect_err("cycle");
        let GraphError::Cycle { path, members } = &err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(rendered(path), ["a.x", "b.y", "a.x"]);
        // c.z depends on the cycle but is not part of it
        assert_eq!(rendered(members), ["a.x", "b.y"]);
    }

    #[test]
    fn test_cycle_reports_every_cyclic_node() {
        let mut specs = SpecSet::new();
        specs.define_resource("a", "one", &BTreeMap::new(), ["a.two"]).expect("one");
        specs.define_resource("a", "two", &BTreeMap::new(), ["a.one"]).expect("two");
        specs.define_resource("b", "one", &BTreeMap::new(), ["b.two"]).expect("b1");
        specs.define_resource("b", "two", &BTreeMap::new(), ["b.one"]).expect("b2");

        let err = GraphBuilder::build(&specs).expect_err("cycle");
        let GraphError::Cycle { members, .. } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(rendered(&members), ["a.one", "a.two", "b.one", "b.two"]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut specs = SpecSet::new();
        specs
            .define_resource("role", "admin", &props(json!({"arn": "${role.admin.arn}"})), [])
            .expect("role");

        let err = GraphBuilder::build(&specs).expect_err("cycle");
        assert_eq!(err.to_string(), "Dependency cycle detected: role.admin -> role.admin");
    }

    #[test]
    fn test_dangling_reference_reports_first_offender() {
        let mut specs = SpecSet::new();
        specs
            .define_resource("service", "b", &props(json!({"db": "${database.gone.endpoint}"})), [])
            .expect("b");
        specs
            .define_resource("service", "a", &BTreeMap::new(), ["queue.missing"])
            .expect("a");

        let err = GraphBuilder::build(&specs).expect_err("dangling");
        let GraphError::DanglingReference { from, missing, via } = err else {
            panic!("expected a dangling reference");
        };
        assert_eq!(from.to_string(), "service.a");
        assert_eq!(missing.to_string(), "queue.missing");
        assert_eq!(via, "depends_on");
    }

    #[test]
    fn test_empty_set_builds_empty_graph() {
        let graph = GraphBuilder::build(&SpecSet::new()).expect("graph");
        assert!(graph.is_empty());
    }
}
