//! Streaming spreadsheet parsing.
//!
//! A [`Workbook`] exposes sheets as row cursors; [`RecordStream`] walks every
//! sheet in file order and turns non-empty rows into [`ParsedRecord`]s,
//! handing them out in bounded batches.

pub mod part_number;
mod memory;
mod record;
mod stream;
mod workbook;

pub use memory::MemoryWorkbook;
pub use record::ParsedRecord;
pub use stream::{ParseStats, RecordStream};
pub use workbook::{CalamineWorkbook, CsvWorkbook, RawRow, RowCursor, Workbook, open_workbook};

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::ParsingConfig;

/// File-level parse failure. The whole ingestion fails with it.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported spreadsheet format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Failed to open workbook {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("Failed to read sheet '{sheet}': {reason}")]
    Sheet { sheet: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single malformed row. It is skipped and counted, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWarning {
    pub sheet: String,
    pub row: u64,
    pub reason: String,
}

/// Progress notifications emitted while a stream is consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// `delta` more records were produced; `total` so far for the file.
    Rows { delta: u64, total: u64 },
    /// A sheet was fully read.
    SheetDone { name: String, rows: u64 },
}

pub type ProgressFn = Arc<dyn Fn(&ParseEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Records produced between `ParseEvent::Rows` reports.
    pub progress_interval: u64,
    /// Cells longer than this (in characters) make the row malformed.
    pub max_cell_chars: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::from_config(&ParsingConfig::default())
    }
}

impl ParseOptions {
    pub fn from_config(config: &ParsingConfig) -> Self {
        Self {
            progress_interval: config.progress_interval.max(1),
            max_cell_chars: config.max_cell_chars,
        }
    }
}
