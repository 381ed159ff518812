//! Planning and execution.
//!
//! This module compares the desired graph with prior state, producing an
//! ordered [`Plan`], and applies plans against a provider.

mod diff;
mod executor;
mod plan;

pub use diff::DiffEngine;
pub use executor::{
    ApplyResult, ApplySummary, CancellationFlag, ExecutorOptions, FailedOp, FailureCause, OpOutcome,
    PlanExecutor,
};
pub use plan::{ChangeKind, ChangeOp, OpSummary, Plan, PlanSummary, PropertyChange, ReplaceReason};
