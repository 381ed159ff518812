//! Command-line interface for Stackwright.
//!
//! This module provides the clap command tree and the formatters used to
//! render plans, apply results, graphs and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
