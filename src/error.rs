//! Crate-level ingestion error.
//!
//! Every stage keeps its own error enum; [`IngestError`] is what a pipeline
//! run fails with, and its [`detail`](IngestError::detail) is what ends up on
//! the failed file record.

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::index::{IndexSyncError, Reconciliation};
use crate::intake::IntakeError;
use crate::parsing::ParseError;
use crate::status::StatusError;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Embedding failed after {attempts} attempts: {source}")]
    Embedding {
        attempts: u32,
        #[source]
        source: EmbeddingError,
    },

    #[error("Indexing error: {0}")]
    IndexSync(#[from] IndexSyncError),

    #[error(
        "Index holds {} documents for file {} but {} rows were parsed",
        .0.indexed,
        .0.file_id,
        .0.expected
    )]
    Inconsistent(Reconciliation),

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Ingestion worker failed: {0}")]
    Worker(String),
}

impl IngestError {
    /// Human-readable text stored on a failed file record.
    pub fn detail(&self) -> String {
        let mut detail = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let text = cause.to_string();
            if !detail.contains(&text) {
                detail.push_str(": ");
                detail.push_str(&text);
            }
            source = cause.source();
        }
        detail
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}
