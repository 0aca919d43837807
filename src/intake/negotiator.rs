use serde::Serialize;

use super::IntakeError;
use crate::config::IntakeConfig;

/// Answer returned to a client whose upload must be chunked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkDecision {
    pub requires_chunked_upload: bool,
    pub message: String,
    pub max_chunk_size: u64,
}

/// Outcome of size negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeDecision {
    /// The upload fits a single request and goes straight to the parser.
    Direct,
    /// The upload must be sent through a chunked session.
    Chunked(ChunkDecision),
}

impl IntakeDecision {
    pub fn requires_chunked_upload(&self) -> bool {
        matches!(self, IntakeDecision::Chunked(_))
    }
}

/// Size-based admission policy.
///
/// Uploads at or above `threshold` bytes require chunking. The chunk size
/// offered to clients never exceeds the threshold.
#[derive(Debug, Clone)]
pub struct ChunkNegotiator {
    threshold: u64,
    max_chunk_size: u64,
    max_upload: u64,
}

impl ChunkNegotiator {
    pub fn new(threshold: u64, max_chunk_size: u64, max_upload: u64) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            max_chunk_size: max_chunk_size.clamp(1, threshold),
            max_upload: max_upload.max(threshold),
        }
    }

    pub fn from_config(config: &IntakeConfig) -> Self {
        Self::new(
            config.chunk_threshold_bytes,
            config.max_chunk_size,
            config.max_upload_bytes,
        )
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn max_upload(&self) -> u64 {
        self.max_upload
    }

    /// Decide how an upload of `declared_size` bytes must be transferred.
    pub fn negotiate(&self, declared_size: u64) -> Result<IntakeDecision, IntakeError> {
        if declared_size == 0 {
            return Err(IntakeError::Empty);
        }
        if declared_size > self.max_upload {
            return Err(IntakeError::Oversized {
                declared: declared_size,
                limit: self.max_upload,
            });
        }
        if declared_size < self.threshold {
            return Ok(IntakeDecision::Direct);
        }

        Ok(IntakeDecision::Chunked(ChunkDecision {
            requires_chunked_upload: true,
            message: format!(
                "File is {} and exceeds the {} single-request limit; upload it in chunks of at most {}",
                format_mib(declared_size),
                format_mib(self.threshold),
                format_mib(self.max_chunk_size)
            ),
            max_chunk_size: self.max_chunk_size,
        }))
    }

    /// Number of chunks a client needs for `declared_size` bytes.
    pub fn expected_chunks(&self, declared_size: u64) -> u64 {
        declared_size.div_ceil(self.max_chunk_size)
    }
}

fn format_mib(bytes: u64) -> String {
    format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
}
