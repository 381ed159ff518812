//! Diff engine comparing the desired graph with recorded state.
//!
//! Produces a [`Plan`]: deletes first, in descending dependency order, then
//! creates, updates and replacements in ascending rank. An undeclared record
//! that a declared record still depends on in state is deleted after the
//! changes, once its dependents have let go of it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use serde_json::Value;

use crate::config::ConfigHasher;
use crate::graph::{DependencyGraph, ResourceNode, topological_sort};
use crate::model::{CapabilityTable, KindCapabilities, ResourceId};
use crate::state::{StateRecord, StateSnapshot};

use super::plan::{ChangeOp, Plan, PropertyChange, ReplaceReason};

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Fingerprint hasher.
    hasher: ConfigHasher,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the plan that moves `prior` to the desired `graph`.
    ///
    /// An empty graph plans the destruction of every live record.
    #[must_use]
    pub fn diff(&self, graph: DependencyGraph, prior: &StateSnapshot, capabilities: &CapabilityTable) -> Plan {
        let prior_ranks = prior_ranks(prior);
        let prior_rank = |id: &ResourceId| prior_ranks.get(id).copied().unwrap_or_default();

        let mut renewed: BTreeSet<ResourceId> = BTreeSet::new();
        let mut deletes: Vec<ChangeOp> = Vec::new();
        let mut changes: Vec<ChangeOp> = Vec::new();

        for node in graph.iter() {
            let id = node.spec.id();
            let record = prior.get(id);

            let Some(live) = record.filter(|r| r.status.is_live()) else {
                debug!("{id}: no live record, planning create");
                changes.push(ChangeOp::Create {
                    spec: node.spec.clone(),
                    previous: record.cloned(),
                    rank: node.rank,
                });
                renewed.insert(id.clone());
                continue;
            };

            for physical_id in &live.deposed {
                deletes.push(ChangeOp::DeleteDeposed {
                    previous: live.clone(),
                    physical_id: physical_id.clone(),
                    rank: prior_rank(id),
                });
            }

            let kind_caps = capabilities.get(id.kind());
            let property_changes = property_changes(node, live, kind_caps, &renewed);

            let reason = if live.is_tainted() {
                Some(ReplaceReason::Tainted)
            } else if property_changes.iter().any(|c| c.forces_replacement) {
                Some(ReplaceReason::ImmutableChange)
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!("{id}: planning replacement ({reason})");
                    changes.push(ChangeOp::Replace {
                        spec: node.spec.clone(),
                        previous: live.clone(),
                        changes: property_changes,
                        strategy: kind_caps.replace_strategy(),
                        reason,
                        rank: node.rank,
                    });
                    renewed.insert(id.clone());
                }
                None if !property_changes.is_empty() => {
                    debug!("{id}: {} updatable properties changed", property_changes.len());
                    changes.push(ChangeOp::Update {
                        spec: node.spec.clone(),
                        previous: live.clone(),
                        changes: property_changes,
                        rank: node.rank,
                    });
                }
                None => {}
            }
        }

        let held = held_by_declared(&graph, prior);
        let mut trailing: Vec<ChangeOp> = Vec::new();

        for (id, record) in prior {
            if graph.contains(id) || !record.status.is_live() {
                continue;
            }
            let target = if held.contains(id) {
                debug!("{id}: no longer declared but still referenced in state, deleting after changes");
                &mut trailing
            } else {
                debug!("{id}: no longer declared, planning delete");
                &mut deletes
            };
            for physical_id in &record.deposed {
                target.push(ChangeOp::DeleteDeposed {
                    previous: record.clone(),
                    physical_id: physical_id.clone(),
                    rank: prior_rank(id),
                });
            }
            target.push(ChangeOp::Delete {
                previous: record.clone(),
                rank: prior_rank(id),
            });
        }

        // Within one rank, deposed cleanups go before the record's own delete
        let delete_order = |op: &ChangeOp| (Reverse(op.rank()), matches!(op, ChangeOp::Delete { .. }));
        deletes.sort_by_key(delete_order);
        trailing.sort_by_key(delete_order);

        let graph_fingerprint = self.hasher.hash_graph(&graph);
        let state_fingerprint = self.hasher.hash_state(prior);

        deletes.extend(changes);
        deletes.extend(trailing);
        Plan::new(deletes, graph, graph_fingerprint, state_fingerprint)
    }
}

/// Compares desired properties with the record.
///
/// A property referencing a resource renewed earlier in this plan counts as
/// changed even if its canonical form is identical, since the reference will
/// resolve to a new value.
fn property_changes(
    node: &ResourceNode,
    record: &StateRecord,
    capabilities: &KindCapabilities,
    renewed: &BTreeSet<ResourceId>,
) -> Vec<PropertyChange> {
    let desired = node.spec.canonical_properties();
    let names: BTreeSet<&String> = desired.keys().chain(record.properties.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let before: Option<&Value> = record.properties.get(name);
            let after: Option<&Value> = desired.get(name);

            let stale_reference = node
                .spec
                .properties()
                .get(name)
                .is_some_and(|value| renewed.iter().any(|target| value.refers_to(target)));

            (before != after || stale_reference).then(|| PropertyChange {
                property: name.clone(),
                before: before.cloned(),
                after: after.cloned(),
                forces_replacement: capabilities.requires_replacement(name),
            })
        })
        .collect()
}

/// Undeclared live records that a declared record still depends on in state,
/// directly or through other undeclared records.
fn held_by_declared(graph: &DependencyGraph, prior: &StateSnapshot) -> BTreeSet<ResourceId> {
    let undeclared = |id: &ResourceId| {
        !graph.contains(id) && prior.get(id).is_some_and(|record| record.status.is_live())
    };

    let mut stack: Vec<&ResourceId> = prior
        .iter()
        .filter(|(id, record)| graph.contains(id) && record.status.is_live())
        .flat_map(|(_, record)| record.dependencies.iter())
        .filter(|dep| undeclared(dep))
        .collect();

    let mut held = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if !held.insert(id.clone()) {
            continue;
        }
        if let Some(record) = prior.get(id) {
            stack.extend(record.dependencies.iter().filter(|dep| undeclared(dep)));
        }
    }
    held
}

/// Orders live prior records by their recorded dependencies.
///
/// Anything the sort cannot place (a stale cycle) follows in identity order.
fn prior_ranks(prior: &StateSnapshot) -> BTreeMap<ResourceId, usize> {
    let edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = prior
        .iter()
        .filter(|(_, record)| record.status.is_live())
        .map(|(id, record)| (id.clone(), record.dependencies.clone()))
        .collect();

    let sorted = topological_sort(&edges);
    sorted
        .order
        .into_iter()
        .chain(sorted.remaining)
        .enumerate()
        .map(|(rank, id)| (id, rank))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{KindCapabilities, ReplaceStrategy, SpecSet};
    use crate::planner::plan::ChangeKind;
    use crate::state::RecordStatus;
    use serde_json::json;

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).expect("object")
    }

    /// a <- b <- c chain of networks, with a tunable property on `a`.
    fn chain(a_size: &str) -> SpecSet {
        let mut specs = SpecSet::new();
        specs
            .define_resource("network", "a", &props(json!({"size": a_size, "tags": {"team": "core"}})), [])
            .expect("a");
        specs
            .define_resource("network", "b", &props(json!({"parent": "${network.a.id}"})), [])
            .expect("b");
        specs
            .define_resource("network", "c", &props(json!({"parent": "${network.b.id}"})), [])
            .expect("c");
        specs
    }

    fn applied(specs: &SpecSet) -> StateSnapshot {
        let graph = GraphBuilder::build(specs).expect("graph");
        graph
            .iter()
            .map(|node| {
                let mut record = StateRecord::new(node.spec.id().clone(), node.spec.canonical_properties());
                record.physical_id = Some(format!("phys-{}", node.spec.id().name()));
                record.dependencies.clone_from(&node.dependencies);
                (node.spec.id().clone(), record)
            })
            .collect()
    }

    fn plan(specs: &SpecSet, prior: &StateSnapshot, capabilities: &CapabilityTable) -> Plan {
        let graph = GraphBuilder::build(specs).expect("graph");
        DiffEngine::new().diff(graph, prior, capabilities)
    }

    fn steps(plan: &Plan) -> Vec<String> {
        plan.ops()
            .iter()
            .map(|op| format!("{} {}", op.kind(), op.id()))
            .collect()
    }

    fn updatable(properties: &[&str]) -> CapabilityTable {
        CapabilityTable::new().with_kind(
            "network",
            KindCapabilities {
                updatable: properties.iter().map(ToString::to_string).collect(),
                ..KindCapabilities::default()
            },
        )
    }

    #[test]
    fn test_empty_state_creates_in_rank_order() {
        let plan = plan(&chain("small"), &StateSnapshot::new(), &CapabilityTable::new());
        assert_eq!(steps(&plan), ["create network.a", "create network.b", "create network.c"]);
    }

    #[test]
    fn test_matching_state_is_a_no_op() {
        let specs = chain("small");
        let plan = plan(&specs, &applied(&specs), &CapabilityTable::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_destroy_deletes_in_reverse_order() {
        let prior = applied(&chain("small"));
        let plan = DiffEngine::new().diff(DependencyGraph::default(), &prior, &CapabilityTable::new());
        assert_eq!(steps(&plan), ["delete network.c", "delete network.b", "delete network.a"]);
    }

    #[test]
    fn test_updatable_change_plans_update() {
        let prior = applied(&chain("small"));
        let plan = plan(&chain("large"), &prior, &updatable(&["size", "tags"]));

        assert_eq!(steps(&plan), ["update network.a"]);
        let changes = plan.ops()[0].changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].property, "size");
        assert_eq!(changes[0].before, Some(json!("small")));
        assert_eq!(changes[0].after, Some(json!("large")));
    }

    #[test]
    fn test_immutable_change_replaces_and_cascades() {
        let prior = applied(&chain("small"));
        let capabilities = updatable(&["tags", "parent"]);
        let plan = plan(&chain("large"), &prior, &capabilities);

        // b's reference to a will resolve to a new id, so b is updated; c is untouched
        assert_eq!(steps(&plan), ["replace network.a", "update network.b"]);
        let ChangeOp::Replace { strategy, reason, .. } = &plan.ops()[0] else {
            panic!("expected a replacement");
        };
        assert_eq!(*strategy, ReplaceStrategy::DeleteBeforeCreate);
        assert_eq!(*reason, ReplaceReason::ImmutableChange);
    }

    #[test]
    fn test_replacement_strategy_follows_capabilities() {
        let prior = applied(&chain("small"));
        let capabilities = CapabilityTable::new().with_kind(
            "network",
            KindCapabilities {
                create_before_destroy: true,
                ..KindCapabilities::default()
            },
        );
        let plan = plan(&chain("large"), &prior, &capabilities);

        // With nothing updatable, each dependent is replaced in turn
        assert_eq!(
            steps(&plan),
            ["replace network.a", "replace network.b", "replace network.c"]
        );
        assert!(plan.ops().iter().all(|op| matches!(
            op,
            ChangeOp::Replace {
                strategy: ReplaceStrategy::CreateBeforeDestroy,
                ..
            }
        )));
    }

    #[test]
    fn test_tainted_record_is_replaced() {
        let specs = chain("small");
        let mut prior = applied(&specs);
        let b = ResourceId::parse("network.b").expect("valid");
        if let Some(record) = prior.get_mut(&b) {
            record.status = RecordStatus::Tainted;
        }

        let plan = plan(&specs, &prior, &updatable(&["parent"]));
        assert_eq!(steps(&plan), ["replace network.b", "update network.c"]);
        assert!(matches!(
            plan.ops()[0],
            ChangeOp::Replace {
                reason: ReplaceReason::Tainted,
                ..
            }
        ));
    }

    #[test]
    fn test_deletes_come_before_creates() {
        let mut prior = applied(&chain("small"));
        let mut specs = chain("small");
        specs
            .define_resource("bucket", "logs", &BTreeMap::new(), [])
            .expect("bucket");
        let stale = ResourceId::parse("queue.old").expect("valid");
        prior.insert(stale.clone(), StateRecord::new(stale, BTreeMap::new()));

        let plan = plan(&specs, &prior, &CapabilityTable::new());
        assert_eq!(steps(&plan), ["delete queue.old", "create bucket.logs"]);
    }

    #[test]
    fn test_referenced_record_is_deleted_after_its_dependent_lets_go() {
        let queue = ResourceId::parse("queue.old").expect("valid");
        let api = ResourceId::parse("service.api").expect("valid");

        let mut prior = StateSnapshot::new();
        let mut old_queue = StateRecord::new(queue.clone(), BTreeMap::new());
        old_queue.physical_id = Some(String::from("q-1"));
        prior.insert(queue.clone(), old_queue);
        let mut old_api = StateRecord::new(api.clone(), props(json!({"q": {"$ref": "queue.old.id"}})));
        old_api.physical_id = Some(String::from("svc-1"));
        old_api.dependencies.insert(queue);
        prior.insert(api, old_api);

        let mut specs = SpecSet::new();
        specs
            .define_resource("service", "api", &props(json!({"q": "none"})), [])
            .expect("api");
        let capabilities = CapabilityTable::new().with_kind(
            "service",
            KindCapabilities {
                updatable: BTreeSet::from([String::from("q")]),
                ..KindCapabilities::default()
            },
        );

        let plan = plan(&specs, &prior, &capabilities);
        assert_eq!(steps(&plan), ["update service.api", "delete queue.old"]);
    }

    #[test]
    fn test_held_deletes_keep_dependency_order() {
        let prior = applied(&chain("small"));

        // Only c stays declared and stops referencing b; b and a go away
        let mut specs = SpecSet::new();
        specs
            .define_resource("network", "c", &props(json!({"parent": "detached"})), [])
            .expect("c");

        let plan = plan(&specs, &prior, &updatable(&["parent"]));
        assert_eq!(
            steps(&plan),
            ["update network.c", "delete network.b", "delete network.a"]
        );
    }

    #[test]
    fn test_deleted_record_counts_as_absent() {
        let specs = chain("small");
        let mut prior = applied(&specs);
        let a = ResourceId::parse("network.a").expect("valid");
        if let Some(record) = prior.get_mut(&a) {
            record.status = RecordStatus::Deleted;
            record.revision = 4;
        }

        let plan = plan(&specs, &prior, &CapabilityTable::new());
        let ChangeOp::Create { previous, .. } = &plan.ops()[0] else {
            panic!("expected a create");
        };
        assert_eq!(previous.as_ref().map(|r| r.revision), Some(4));
        // b depended on the old a, so its reference now resolves differently
        assert_eq!(plan.count(ChangeKind::Replace), 2);
    }

    #[test]
    fn test_deposed_instances_are_cleaned_up() {
        let specs = chain("small");
        let mut prior = applied(&specs);
        let a = ResourceId::parse("network.a").expect("valid");
        if let Some(record) = prior.get_mut(&a) {
            record.deposed = vec![String::from("phys-old-a")];
        }

        let plan = plan(&specs, &prior, &CapabilityTable::new());
        assert_eq!(steps(&plan), ["delete-deposed network.a"]);
        let ChangeOp::DeleteDeposed { physical_id, .. } = &plan.ops()[0] else {
            panic!("expected a deposed cleanup");
        };
        assert_eq!(physical_id, "phys-old-a");
    }

    #[test]
    fn test_plans_are_deterministic() {
        let prior = applied(&chain("small"));
        let first = plan(&chain("large"), &prior, &CapabilityTable::new());
        let second = plan(&chain("large"), &prior, &CapabilityTable::new());
        assert_eq!(steps(&first), steps(&second));
        assert_eq!(first.graph_fingerprint, second.graph_fingerprint);
        assert_eq!(first.state_fingerprint, second.state_fingerprint);
    }
}
