// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code is reported
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are reported
#![warn(unused_variables)]            // Unused variables are reported
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A declarative resource orchestration engine: describe the resources you
//! want, and Stackwright works out the order to create them in, what changed
//! since the last run, and applies the difference one step at a time.
//!
//! ## Architecture
//!
//! A plan/apply cycle flows through five stages:
//!
//! 1. **Resource model**: a flat set of resource specs whose properties may
//!    reference other resources' outputs (`${kind.name.attribute}`)
//! 2. **Dependency graph**: edges from references and explicit
//!    `depends_on`, ranked by Kahn's algorithm
//! 3. **Diff engine**: desired graph vs. recorded state, giving an ordered
//!    plan of creates, updates, replacements and deletes
//! 4. **Plan executor**: applies ops sequentially through a provider,
//!    persisting state after every op
//! 5. **State store**: one durable record per resource (local files, S3)
//!
//! ## Modules
//!
//! - [`model`]: resource identities, specs, references and kind capabilities
//! - [`graph`]: dependency graph construction
//! - [`planner`]: diffing, plans and the executor
//! - [`provider`]: the provider interface, a sandbox and an HTTP adapter
//! - [`state`]: state records, stores and locking
//! - [`config`]: the `stackwright.yaml` stack file
//! - [`engine`]: the orchestrator tying the stages together
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! kinds:
//!   service:
//!     updatable: [image, env]
//!
//! resources:
//!   - kind: database
//!     name: main
//!     properties:
//!       engine: postgres
//!   - kind: service
//!     name: api
//!     properties:
//!       image: shop/api:1
//!       env:
//!         DB_HOST: "${database.main.endpoint}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use engine::Orchestrator;
pub use error::{Result, StackwrightError};
pub use graph::{DependencyGraph, GraphBuilder};
pub use model::{ResourceId, ResourceSpec, SpecSet};
pub use planner::{ApplyResult, DiffEngine, Plan, PlanExecutor};
pub use provider::{Provider, SandboxProvider};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
