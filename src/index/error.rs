use tantivy::TantivyError;
use tantivy::directory::error::OpenDirectoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] TantivyError),

    #[error("Directory error: {0}")]
    Directory(#[from] OpenDirectoryError),

    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document {doc_id}: {reason}")]
    InvalidDocument { doc_id: String, reason: String },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IndexError {
    /// Whether retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Tantivy(TantivyError::InvalidArgument(_))
            | IndexError::Tantivy(TantivyError::SchemaError(_))
            | IndexError::InvalidDocument { .. }
            | IndexError::InvalidQuery(_)
            | IndexError::Serialization(_) => false,
            IndexError::Tantivy(_)
            | IndexError::Directory(_)
            | IndexError::Unavailable(_)
            | IndexError::Io(_) => true,
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
