//! File lifecycle tracking.
//!
//! The [`StatusTracker`] is the only writer of [`FileRecord`]s. Other
//! components refer to files by [`FileId`](crate::FileId) and request
//! changes through the tracker.

mod state;
mod tracker;

pub use state::FileStatus;
pub use tracker::{FileRecord, FileStatusView, StatusTracker};

use thiserror::Error;

use crate::types::FileId;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("File not found: {0}")]
    NotFound(FileId),

    #[error("File {file_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        file_id: FileId,
        from: FileStatus,
        to: FileStatus,
    },

    #[error("File {file_id}: row count cannot decrease (delta {delta})")]
    NegativeRowDelta { file_id: FileId, delta: i64 },

    #[error("File {0} is still being ingested")]
    Busy(FileId),

    #[error("File id space exhausted")]
    IdsExhausted,

    #[error("Status snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
