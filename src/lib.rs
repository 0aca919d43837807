pub mod logging;

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod intake;
pub mod parsing;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod service;
pub mod status;
pub mod types;

pub use config::Settings;
pub use embedding::{EmbeddingError, EmbeddingGenerator, SharedEmbedder};
pub use error::IngestError;
pub use index::{IndexSynchronizer, Reconciliation, SearchHit, SearchIndex, SearchPage, TantivyIndex};
pub use intake::{ChunkDecision, ChunkNegotiator, ChunkPosition, IntakeDecision, IntakeError};
pub use parsing::{ParseError, ParsedRecord, RecordStream};
pub use pipeline::{IngestPipeline, IngestReport, PipelineConfig};
pub use query::{QueryFilter, QueryService, SearchRequest};
pub use service::{ChunkOutcome, IngestService, ServiceError, SubmitOutcome};
pub use status::{FileRecord, FileStatus, FileStatusView, StatusTracker};
pub use types::{DocumentId, FileId};
