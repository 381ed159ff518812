//! Dependency graph for resource specs.
//!
//! Infers edges from property references and explicit dependencies, rejects
//! dangling references and cycles, and assigns deterministic ranks.

mod builder;
mod dag;
mod node;

pub use builder::GraphBuilder;
pub use node::{DependencyGraph, ResourceNode};
pub(crate) use dag::topological_sort;
