//! Subcommand handlers.

pub mod files;
pub mod init;
pub mod search;
