//! Search index boundary.
//!
//! [`SearchIndex`] is what the pipeline and the query service talk to;
//! [`TantivyIndex`] is the on-disk implementation. [`IndexSynchronizer`]
//! adds retries and reconciliation on top of any implementation.

mod error;
pub mod schema;
mod sync;
mod tantivy_index;

pub use error::{IndexError, IndexResult};
pub use schema::IndexSchema;
pub use sync::{IndexSyncError, IndexSynchronizer, Reconciliation};
pub use tantivy_index::TantivyIndex;

use indexmap::IndexMap;
use serde::Serialize;

use crate::parsing::ParsedRecord;
use crate::types::{DocumentId, FileId};

/// A parsed row with its embedding, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: DocumentId,
    pub record: ParsedRecord,
    pub embedding: Vec<f32>,
}

impl IndexedDocument {
    pub fn new(record: ParsedRecord, embedding: Vec<f32>) -> Self {
        Self {
            id: record.document_id(),
            record,
            embedding,
        }
    }
}

/// What to match.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexFilter {
    All,
    /// Part number, compared by match key.
    PartNumber(String),
    /// Exact, case-insensitive value of one column.
    Field { name: String, value: String },
    /// Keyword query over all cell text.
    Text(String),
    /// Nearest neighbours of a unit vector.
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub filter: IndexFilter,
    pub file_id: Option<FileId>,
    pub sheet: Option<String>,
}

impl IndexQuery {
    pub fn new(filter: IndexFilter) -> Self {
        Self {
            filter,
            file_id: None,
            sheet: None,
        }
    }

    pub fn in_file(mut self, file_id: FileId) -> Self {
        self.file_id = Some(file_id);
        self
    }

    pub fn in_sheet(mut self, sheet: impl Into<String>) -> Self {
        self.sheet = Some(sheet.into());
        self
    }
}

/// A stored document as returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub file_id: FileId,
    pub sheet: String,
    pub row_index: u64,
    pub part_number: Option<String>,
    pub fields: IndexMap<String, String>,
    pub score: f32,
}

/// One page of results. `total` counts all matches, not just this page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub total: usize,
    pub offset: usize,
    pub hits: Vec<SearchHit>,
}

impl SearchPage {
    pub fn empty(offset: usize) -> Self {
        Self {
            total: 0,
            offset,
            hits: Vec::new(),
        }
    }
}

/// A document store addressed by [`DocumentId`].
pub trait SearchIndex: Send + Sync {
    /// Insert or replace documents by id, atomically per call.
    fn upsert(&self, documents: &[IndexedDocument]) -> IndexResult<()>;

    /// Documents attributed to `file_id`.
    fn count_for_file(&self, file_id: FileId) -> IndexResult<u64>;

    /// Remove every document of `file_id`; returns how many were removed.
    fn delete_file(&self, file_id: FileId) -> IndexResult<u64>;

    fn search(&self, query: &IndexQuery, offset: usize, limit: usize) -> IndexResult<SearchPage>;

    fn document_count(&self) -> IndexResult<u64>;
}
