//! Provider adapters.
//!
//! This module provides the provider interface and its implementations:
//! - A local sandbox that simulates a cloud, with fault injection
//! - A generic REST adapter built on `reqwest`

mod http;
mod sandbox;
mod traits;

pub use http::HttpProvider;
pub use sandbox::{SandboxCall, SandboxProvider, SandboxResource};
pub use traits::{Provider, ProviderOp, Provisioned, ResourceRequest};

#[cfg(test)]
pub use traits::MockProvider;
