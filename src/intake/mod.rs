//! Upload intake.
//!
//! Decides whether an upload may be sent in one request or must be chunked,
//! and reassembles chunked uploads into a complete staged file before any
//! parser sees them.

mod negotiator;
mod session;

pub use negotiator::{ChunkDecision, ChunkNegotiator, IntakeDecision};
pub use session::{
    ChunkPosition, ChunkProgress, CompletedUpload, SessionTicket, UploadSessionManager,
};
pub(crate) use session::spool_file;

use thiserror::Error;

/// Errors raised while admitting or reassembling an upload.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Upload is empty")]
    Empty,

    #[error("Declared size {declared} bytes exceeds the upload limit of {limit} bytes")]
    Oversized { declared: u64, limit: u64 },

    #[error("Upload '{filename}' declared {declared} bytes but {actual} bytes were received")]
    SizeMismatch {
        filename: String,
        declared: u64,
        actual: u64,
    },

    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    #[error("Chunk at offset {got} is out of order for session {session_id}; expected offset {expected}")]
    OutOfOrder {
        session_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Chunk at offset {got} overlaps data already received for session {session_id}; expected offset {expected}")]
    DuplicateRange {
        session_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Chunk of {size} bytes exceeds the maximum chunk size of {max} bytes")]
    ChunkTooLarge { size: u64, max: u64 },

    #[error("Chunk ending at byte {end} exceeds the declared size of {declared} bytes")]
    ExceedsDeclared { end: u64, declared: u64 },

    #[error("Chunk is empty")]
    EmptyChunk,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntakeError {
    /// Whether the client can recover by resending from the expected offset.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntakeError::OutOfOrder { .. } | IntakeError::DuplicateRange { .. }
        )
    }

    /// Offset the session expects next, for retryable errors.
    pub fn expected_offset(&self) -> Option<u64> {
        match self {
            IntakeError::OutOfOrder { expected, .. }
            | IntakeError::DuplicateRange { expected, .. } => Some(*expected),
            _ => None,
        }
    }
}
