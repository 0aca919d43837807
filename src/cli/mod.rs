//! Command-line interface.
//!
//! Argument parsing lives in [`args`]; each subcommand's handler in
//! [`commands`].

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, SearchMode};
