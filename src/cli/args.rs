//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand, ValueEnum,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "sheetdex",
    version,
    about = "Ingest spreadsheets into a searchable row index",
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Settings file (defaults to the nearest .sheetdex/settings.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up the .sheetdex directory
    Init {
        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Ingest one or more spreadsheet files
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// List ingested files, oldest first
    Files {
        #[arg(long)]
        json: bool,
    },

    /// Show one file's status
    Status {
        id: u32,

        #[arg(long)]
        json: bool,
    },

    /// Search indexed rows
    Search {
        /// Query text; `column=value` for field mode
        #[arg(required = true)]
        query: Vec<String>,

        #[arg(short, long, value_enum, default_value_t = SearchMode::Text)]
        mode: SearchMode,

        /// Only rows from this file
        #[arg(long)]
        file: Option<u32>,

        /// Only rows from this sheet
        #[arg(long)]
        sheet: Option<String>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Compare a file's row count with its indexed documents
    Verify { id: u32 },

    /// Delete a finished file and its documents
    Delete { id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchMode {
    /// Part number, ignoring separators and case
    Part,
    /// Exact `column=value`
    Field,
    /// Keywords over all cells
    Text,
    /// Embedding similarity
    Semantic,
}
