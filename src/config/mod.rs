//! Stack configuration.
//!
//! This module handles everything about `stackwright.yaml`:
//! - Parsing and deserializing the stack file
//! - Environment overrides and `.env` loading
//! - Validation of configuration values
//! - Fingerprints for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    ExecutorConfig, KindConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig, StackConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
