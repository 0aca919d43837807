//! Read-only search over the row index.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::QueryConfig;
use crate::debug_event;
use crate::embedding::{EmbeddingError, SharedEmbedder};
use crate::index::{IndexError, IndexFilter, IndexQuery, SearchIndex, SearchPage};
use crate::types::FileId;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid search request: {0}")]
    InvalidRequest(String),

    #[error("Failed to embed query: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

/// What a caller searches for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum QueryFilter {
    /// Every document in scope.
    All,
    PartNumber(String),
    /// Exact value of one column, case-insensitive.
    Field { name: String, value: String },
    /// Keywords over all cell text.
    Text(String),
    /// Rows whose embedding is closest to the embedding of this text.
    Semantic(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub filter: QueryFilter,
    #[serde(default)]
    pub file_id: Option<FileId>,
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub offset: usize,
    /// Page size; the configured default when absent.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(filter: QueryFilter) -> Self {
        Self {
            filter,
            file_id: None,
            sheet: None,
            offset: 0,
            limit: None,
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

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Translates search requests into index queries. Never writes.
#[derive(Clone)]
pub struct QueryService {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<SharedEmbedder>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(index: Arc<dyn SearchIndex>, embedder: Arc<SharedEmbedder>, config: QueryConfig) -> Self {
        Self {
            index,
            embedder,
            config,
        }
    }

    /// Effective page size for a request.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.default_page_size)
            .min(self.config.max_page_size)
    }

    pub fn search(&self, request: &SearchRequest) -> Result<SearchPage, QueryError> {
        let filter = match &request.filter {
            QueryFilter::All => IndexFilter::All,
            QueryFilter::PartNumber(part) => {
                if part.trim().is_empty() {
                    return Err(QueryError::InvalidRequest("empty part number".to_string()));
                }
                IndexFilter::PartNumber(part.clone())
            }
            QueryFilter::Field { name, value } => {
                if name.trim().is_empty() {
                    return Err(QueryError::InvalidRequest("empty field name".to_string()));
                }
                IndexFilter::Field {
                    name: name.clone(),
                    value: value.clone(),
                }
            }
            QueryFilter::Text(text) => {
                if text.trim().is_empty() {
                    return Err(QueryError::InvalidRequest("empty text query".to_string()));
                }
                IndexFilter::Text(text.clone())
            }
            QueryFilter::Semantic(text) => {
                if text.trim().is_empty() {
                    return Err(QueryError::InvalidRequest("empty semantic query".to_string()));
                }
                IndexFilter::Vector(self.embedder.embed_one(text)?)
            }
        };

        let mut query = IndexQuery::new(filter);
        query.file_id = request.file_id;
        query.sheet = request.sheet.clone();

        let limit = self.page_size(request.limit);
        if request.offset > self.config.max_offset || request.offset.checked_add(limit).is_none() {
            return Err(QueryError::InvalidRequest(format!(
                "offset {} exceeds the maximum of {}",
                request.offset, self.config.max_offset
            )));
        }
        let page = self.index.search(&query, request.offset, limit)?;
        debug_event!(
            "query",
            "search",
            "{} of {} hits at offset {}",
            page.hits.len(),
            page.total,
            page.offset
        );
        Ok(page)
    }
}
