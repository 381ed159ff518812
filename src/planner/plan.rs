//! Plan types.
//!
//! A [`Plan`] is the ordered list of [`ChangeOp`]s the diff engine produced,
//! together with the graph it came from. It is consumed exactly once by the
//! executor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::graph::DependencyGraph;
use crate::model::{ReplaceStrategy, ResourceId, ResourceSpec};
use crate::state::StateRecord;

/// One changed property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property name.
    pub property: String,
    /// Last-applied value.
    pub before: Option<Value>,
    /// Desired value.
    pub after: Option<Value>,
    /// Whether this change alone forces a replacement.
    pub forces_replacement: bool,
}

/// Why a resource is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceReason {
    /// A changed property cannot be updated in place.
    ImmutableChange,
    /// A previous provider call failed and left the resource tainted.
    Tainted,
}

/// A single planned change.
#[derive(Debug, Clone)]
pub enum ChangeOp {
    /// Create a resource that has no live record.
    Create {
        /// Desired spec.
        spec: ResourceSpec,
        /// Leftover `Deleted` record, if any, whose revision counter continues.
        previous: Option<StateRecord>,
        /// Graph rank.
        rank: usize,
    },
    /// Update a resource in place.
    Update {
        /// Desired spec.
        spec: ResourceSpec,
        /// Current record.
        previous: StateRecord,
        /// Changed properties.
        changes: Vec<PropertyChange>,
        /// Graph rank.
        rank: usize,
    },
    /// Replace a resource with a new physical instance.
    Replace {
        /// Desired spec.
        spec: ResourceSpec,
        /// Current record.
        previous: StateRecord,
        /// Changed properties (empty when replacing a tainted resource as-is).
        changes: Vec<PropertyChange>,
        /// Order of the delete and create calls.
        strategy: ReplaceStrategy,
        /// Why the resource is replaced.
        reason: ReplaceReason,
        /// Graph rank.
        rank: usize,
    },
    /// Delete a resource that is no longer declared.
    Delete {
        /// Current record.
        previous: StateRecord,
        /// Rank within the prior state's dependency order.
        rank: usize,
    },
    /// Delete an old instance left behind by a create-before-destroy replacement.
    DeleteDeposed {
        /// Record holding the deposed id.
        previous: StateRecord,
        /// Physical id of the old instance.
        physical_id: String,
        /// Rank within the prior state's dependency order.
        rank: usize,
    },
}

/// Kind of change, for display and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// See [`ChangeOp::Create`].
    Create,
    /// See [`ChangeOp::Update`].
    Update,
    /// See [`ChangeOp::Replace`].
    Replace,
    /// See [`ChangeOp::Delete`].
    Delete,
    /// See [`ChangeOp::DeleteDeposed`].
    DeleteDeposed,
}

/// An ordered, immutable set of changes.
#[derive(Debug)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the desired graph.
    pub graph_fingerprint: String,
    /// Fingerprint of the prior state the plan was computed against.
    pub state_fingerprint: String,
    ops: Vec<ChangeOp>,
    graph: DependencyGraph,
}

/// Serializable view of one op.
#[derive(Debug, Clone, Serialize)]
pub struct OpSummary {
    /// Position in the plan.
    pub index: usize,
    /// Change kind.
    pub action: ChangeKind,
    /// Resource identity.
    pub identity: String,
    /// Rank used for ordering.
    pub rank: usize,
    /// Changed properties.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<PropertyChange>,
    /// Replacement order, for replacements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ReplaceStrategy>,
    /// Replacement reason, for replacements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReplaceReason>,
    /// Physical id the op acts on, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
}

/// Serializable view of a plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the desired graph.
    pub graph_fingerprint: String,
    /// Fingerprint of the prior state.
    pub state_fingerprint: String,
    /// Number of creates.
    pub creates: usize,
    /// Number of updates.
    pub updates: usize,
    /// Number of replacements.
    pub replaces: usize,
    /// Number of deletes, deposed cleanups included.
    pub deletes: usize,
    /// Ops in execution order.
    pub ops: Vec<OpSummary>,
}

impl ChangeOp {
    /// Identity of the resource this op acts on.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Create { spec, .. } | Self::Update { spec, .. } | Self::Replace { spec, .. } => spec.id(),
            Self::Delete { previous, .. } | Self::DeleteDeposed { previous, .. } => &previous.identity,
        }
    }

    /// Rank used for ordering.
    #[must_use]
    pub const fn rank(&self) -> usize {
        match self {
            Self::Create { rank, .. }
            | Self::Update { rank, .. }
            | Self::Replace { rank, .. }
            | Self::Delete { rank, .. }
            | Self::DeleteDeposed { rank, .. } => *rank,
        }
    }

    /// Change kind.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Create { .. } => ChangeKind::Create,
            Self::Update { .. } => ChangeKind::Update,
            Self::Replace { .. } => ChangeKind::Replace,
            Self::Delete { .. } => ChangeKind::Delete,
            Self::DeleteDeposed { .. } => ChangeKind::DeleteDeposed,
        }
    }

    /// Returns true for ops that only remove physical resources.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. } | Self::DeleteDeposed { .. })
    }

    /// Changed properties, for updates and replacements.
    #[must_use]
    pub fn changes(&self) -> &[PropertyChange] {
        match self {
            Self::Update { changes, .. } | Self::Replace { changes, .. } => changes,
            _ => &[],
        }
    }

    fn summary(&self, index: usize) -> OpSummary {
        let (strategy, reason) = match self {
            Self::Replace { strategy, reason, .. } => (Some(*strategy), Some(*reason)),
            _ => (None, None),
        };
        let physical_id = match self {
            Self::Create { .. } => None,
            Self::Update { previous, .. } | Self::Replace { previous, .. } | Self::Delete { previous, .. } => {
                previous.physical_id.clone()
            }
            Self::DeleteDeposed { physical_id, .. } => Some(physical_id.clone()),
        };

        OpSummary {
            index,
            action: self.kind(),
            identity: self.id().to_string(),
            rank: self.rank(),
            changes: self.changes().to_vec(),
            strategy,
            reason,
            physical_id,
        }
    }
}

impl Plan {
    pub(crate) fn new(
        ops: Vec<ChangeOp>,
        graph: DependencyGraph,
        graph_fingerprint: String,
        state_fingerprint: String,
    ) -> Self {
        Self {
            created_at: Utc::now(),
            graph_fingerprint,
            state_fingerprint,
            ops,
            graph,
        }
    }

    /// Ops in execution order.
    #[must_use]
    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    /// The desired graph this plan was computed from.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Splits the plan into its ops and graph.
    #[must_use]
    pub fn into_parts(self) -> (Vec<ChangeOp>, DependencyGraph) {
        (self.ops, self.graph)
    }

    /// Returns true if the plan has no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Number of ops of one kind.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.ops.iter().filter(|op| op.kind() == kind).count()
    }

    /// Serializable summary.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            created_at: self.created_at,
            graph_fingerprint: self.graph_fingerprint.clone(),
            state_fingerprint: self.state_fingerprint.clone(),
            creates: self.count(ChangeKind::Create),
            updates: self.count(ChangeKind::Update),
            replaces: self.count(ChangeKind::Replace),
            deletes: self.count(ChangeKind::Delete) + self.count(ChangeKind::DeleteDeposed),
            ops: self
                .ops
                .iter()
                .enumerate()
                .map(|(index, op)| op.summary(index))
                .collect(),
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::DeleteDeposed => "delete-deposed",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ReplaceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImmutableChange => write!(f, "immutable property changed"),
            Self::Tainted => write!(f, "tainted by a failed apply"),
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())?;
        match self {
            Self::Replace { strategy, reason, .. } => write!(f, " ({reason}, {strategy})"),
            Self::Update { changes, .. } => {
                let names: Vec<&str> = changes.iter().map(|c| c.property.as_str()).collect();
                write!(f, " ({})", names.join(", "))
            }
            Self::DeleteDeposed { physical_id, .. } => write!(f, " ({physical_id})"),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ops.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} changes):", self.ops.len())?;
        for (i, op) in self.ops.iter().enumerate() {
            writeln!(f, "  {i}. {op}")?;
        }
        Ok(())
    }
}
