use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::{IndexError, IndexedDocument, SearchIndex};
use crate::parsing::ParsedRecord;
use crate::retry::{Exhausted, RetryPolicy};
use crate::types::FileId;
use crate::{debug_event, log_event};

#[derive(Error, Debug)]
pub enum IndexSyncError {
    #[error("Indexing file {file_id} failed after {attempts} attempts: {source}")]
    Exhausted {
        file_id: FileId,
        attempts: u32,
        #[source]
        source: IndexError,
    },

    #[error("Index rejected batch for file {file_id}: {source}")]
    Rejected {
        file_id: FileId,
        #[source]
        source: IndexError,
    },

    #[error("{records} records but {embeddings} embeddings")]
    Mismatch { records: usize, embeddings: usize },

    #[error("Index read failed: {0}")]
    Read(#[from] IndexError),
}

/// Indexed document count for a file compared with its expected row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub file_id: FileId,
    pub expected: u64,
    pub indexed: u64,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.expected == self.indexed
    }
}

/// Writes parsed rows to a [`SearchIndex`] with bounded retries.
#[derive(Clone)]
pub struct IndexSynchronizer {
    index: Arc<dyn SearchIndex>,
    retry: RetryPolicy,
}

impl IndexSynchronizer {
    pub fn new(index: Arc<dyn SearchIndex>, retry: RetryPolicy) -> Self {
        Self { index, retry }
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    /// Upsert one document per record. Returns the number written.
    pub fn sync_batch(
        &self,
        file_id: FileId,
        records: Vec<ParsedRecord>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<usize, IndexSyncError> {
        if records.len() != embeddings.len() {
            return Err(IndexSyncError::Mismatch {
                records: records.len(),
                embeddings: embeddings.len(),
            });
        }
        let documents: Vec<IndexedDocument> = records
            .into_iter()
            .zip(embeddings)
            .map(|(record, embedding)| IndexedDocument::new(record, embedding))
            .collect();

        self.with_retry(file_id, "upsert", |index| index.upsert(&documents))?;
        debug_event!("index", "batch synced", "file {file_id}: {}", documents.len());
        Ok(documents.len())
    }

    /// Count what the index holds for `file_id` against `expected`.
    pub fn verify(&self, file_id: FileId, expected: u64) -> Result<Reconciliation, IndexSyncError> {
        let indexed = self.index.count_for_file(file_id)?;
        Ok(Reconciliation {
            file_id,
            expected,
            indexed,
        })
    }

    /// Remove every document of `file_id`.
    pub fn purge(&self, file_id: FileId) -> Result<u64, IndexSyncError> {
        let removed = self.with_retry(file_id, "purge", |index| index.delete_file(file_id))?;
        log_event!("index", "purged", "file {file_id}: {removed} documents");
        Ok(removed)
    }

    fn with_retry<T, F>(&self, file_id: FileId, what: &str, op: F) -> Result<T, IndexSyncError>
    where
        F: Fn(&dyn SearchIndex) -> Result<T, IndexError>,
    {
        self.retry
            .run(what, |_| op(self.index.as_ref()), IndexError::is_transient)
            .map_err(|Exhausted { attempts, error }| {
                if error.is_transient() {
                    IndexSyncError::Exhausted {
                        file_id,
                        attempts,
                        source: error,
                    }
                } else {
                    IndexSyncError::Rejected {
                        file_id,
                        source: error,
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexQuery, IndexResult, SearchPage, TantivyIndex};
    use indexmap::IndexMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` upserts with a transient error.
    struct FlakyIndex {
        inner: TantivyIndex,
        failures: u32,
        calls: AtomicU32,
    }

    impl SearchIndex for FlakyIndex {
        fn upsert(&self, documents: &[IndexedDocument]) -> IndexResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(IndexError::Unavailable(format!("call {call}")));
            }
            self.inner.upsert(documents)
        }

        fn count_for_file(&self, file_id: FileId) -> IndexResult<u64> {
            self.inner.count_for_file(file_id)
        }

        fn delete_file(&self, file_id: FileId) -> IndexResult<u64> {
            self.inner.delete_file(file_id)
        }

        fn search(&self, query: &IndexQuery, offset: usize, limit: usize) -> IndexResult<SearchPage> {
            self.inner.search(query, offset, limit)
        }

        fn document_count(&self) -> IndexResult<u64> {
            self.inner.document_count()
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyIndex> {
        Arc::new(FlakyIndex {
            inner: TantivyIndex::in_memory(20_000_000).unwrap(),
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn records(file: u32, n: u64) -> Vec<ParsedRecord> {
        (0..n)
            .map(|i| {
                let mut fields = IndexMap::new();
                fields.insert("Part Number".to_string(), format!("PN-{i}"));
                ParsedRecord {
                    file_id: FileId::new(file).unwrap(),
                    sheet: "Sheet1".to_string(),
                    row_index: i + 2,
                    fields,
                    part_number: Some(format!("PN-{i}")),
                }
            })
            .collect()
    }

    fn vectors(n: u64) -> Vec<Vec<f32>> {
        (0..n).map(|_| vec![1.0, 0.0]).collect()
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let index = flaky(2);
        let sync = IndexSynchronizer::new(index.clone(), RetryPolicy::immediate(3));
        let file = FileId::new(1).unwrap();

        assert_eq!(sync.sync_batch(file, records(1, 5), vectors(5)).unwrap(), 5);
        assert_eq!(index.calls.load(Ordering::SeqCst), 3);
        assert!(sync.verify(file, 5).unwrap().is_consistent());
    }

    #[test]
    fn test_exhausted_retries_surface_error() {
        let index = flaky(10);
        let sync = IndexSynchronizer::new(index.clone(), RetryPolicy::immediate(3));
        let file = FileId::new(1).unwrap();

        let err = sync.sync_batch(file, records(1, 2), vectors(2)).unwrap_err();
        assert!(matches!(err, IndexSyncError::Exhausted { attempts: 3, .. }));
        assert_eq!(sync.verify(file, 2).unwrap().indexed, 0);
    }

    #[test]
    fn test_resync_is_idempotent() {
        let sync = IndexSynchronizer::new(flaky(0), RetryPolicy::immediate(1));
        let file = FileId::new(4).unwrap();
        sync.sync_batch(file, records(4, 10), vectors(10)).unwrap();
        sync.sync_batch(file, records(4, 10), vectors(10)).unwrap();

        let report = sync.verify(file, 10).unwrap();
        assert_eq!(report.indexed, 10);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_mismatched_embeddings_rejected() {
        let sync = IndexSynchronizer::new(flaky(0), RetryPolicy::immediate(1));
        let err = sync
            .sync_batch(FileId::new(1).unwrap(), records(1, 3), vectors(2))
            .unwrap_err();
        assert!(matches!(err, IndexSyncError::Mismatch { records: 3, embeddings: 2 }));
    }

    #[test]
    fn test_purge_removes_file_documents() {
        let sync = IndexSynchronizer::new(flaky(0), RetryPolicy::immediate(1));
        let file = FileId::new(2).unwrap();
        sync.sync_batch(file, records(2, 4), vectors(4)).unwrap();
        assert_eq!(sync.purge(file).unwrap(), 4);
        assert_eq!(sync.verify(file, 0).unwrap().indexed, 0);
    }
}
