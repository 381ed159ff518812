//! Resource model for Stackwright.
//!
//! This module defines the desired-state vocabulary:
//! - Resource identities, property values and references
//! - Resource specifications and the set that holds them
//! - The per-kind capability table

mod capability;
mod resource;

pub use capability::{CapabilityTable, KindCapabilities, ReplaceStrategy, RetryPolicy};
pub use resource::{PropertyValue, REF_KEY, ResourceId, ResourceRef, ResourceSpec, SpecSet};
pub(crate) use resource::is_valid_name;
