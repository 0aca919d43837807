//! Ingestion pipeline
//!
//! Runs one file from a complete staged upload to indexed documents.
//!
//! ```text
//! PARSE ──[bounded channel]──▶ EMBED ─▶ INDEX
//!  │                             │        │
//!  ▼                             ▼        ▼
//! [batches of rows]          [vectors]  upsert by document id
//! ```
//!
//! The parser runs on its own thread and blocks once `channel_capacity`
//! batches are waiting, so memory stays bounded however large the file is.
//! Embedding and index writes happen batch by batch on the calling thread.

pub mod config;

pub use config::PipelineConfig;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Settings;
use crate::embedding::{EmbeddingError, SharedEmbedder};
use crate::error::IngestError;
use crate::index::{IndexSynchronizer, Reconciliation, SearchIndex};
use crate::parsing::{
    ParseError, ParseEvent, ParseStats, ParsedRecord, ProgressFn, RecordStream, Workbook,
};
use crate::retry::{Exhausted, RetryPolicy};
use crate::status::{FileStatus, StatusError, StatusTracker};
use crate::types::FileId;
use crate::{debug_event, log_event, warn_event};

type BatchMessage = Result<Vec<ParsedRecord>, ParseError>;

/// Counters for one pass over a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub sheets: u32,
    pub records_parsed: u64,
    pub records_indexed: u64,
    pub rows_skipped: u64,
    pub batches: u64,
    pub elapsed: Duration,
}

/// Outcome of a completed ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub file_id: FileId,
    pub stats: IngestStats,
    pub reconciliation: Reconciliation,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    embedder: Arc<SharedEmbedder>,
    sync: IndexSynchronizer,
}

impl IngestPipeline {
    pub fn new(config: PipelineConfig, embedder: Arc<SharedEmbedder>, index: Arc<dyn SearchIndex>) -> Self {
        let sync = IndexSynchronizer::new(index, config.index_retry);
        Self {
            config,
            embedder,
            sync,
        }
    }

    pub fn with_settings(
        settings: &Settings,
        embedder: Arc<SharedEmbedder>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self::new(PipelineConfig::from_settings(settings), embedder, index)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &IndexSynchronizer {
        &self.sync
    }

    pub fn embedder(&self) -> &Arc<SharedEmbedder> {
        &self.embedder
    }

    /// Ingest the file at `path` under the lifecycle of `file_id`.
    ///
    /// The record moves to `processing`, its row count grows as sheets are
    /// read, and it ends `completed` only once the index holds exactly the
    /// parsed rows. Any failure purges the file's partial documents (when
    /// configured) before the record is marked `failed`.
    pub fn run(
        &self,
        file_id: FileId,
        path: &Path,
        tracker: &Arc<StatusTracker>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let options = self.config.parse.clone();
        self.run_tracked(file_id, tracker, cancel, || {
            RecordStream::open(path, file_id, options)
        })
    }

    /// Like [`run`](Self::run), for an already opened workbook.
    pub fn run_workbook(
        &self,
        file_id: FileId,
        workbook: Box<dyn Workbook>,
        tracker: &Arc<StatusTracker>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let options = self.config.parse.clone();
        self.run_tracked(file_id, tracker, cancel, || {
            Ok(RecordStream::from_workbook(workbook, file_id, options))
        })
    }

    fn run_tracked<F>(
        &self,
        file_id: FileId,
        tracker: &Arc<StatusTracker>,
        cancel: &CancellationToken,
        open: F,
    ) -> Result<IngestReport, IngestError>
    where
        F: FnOnce() -> Result<RecordStream, ParseError>,
    {
        let result = self.run_lifecycle(file_id, tracker, cancel, open);
        if let Err(error) = &result {
            self.abandon(file_id, tracker, error);
        }
        result
    }

    fn run_lifecycle<F>(
        &self,
        file_id: FileId,
        tracker: &Arc<StatusTracker>,
        cancel: &CancellationToken,
        open: F,
    ) -> Result<IngestReport, IngestError>
    where
        F: FnOnce() -> Result<RecordStream, ParseError>,
    {
        tracker.advance(file_id, FileStatus::Processing, None)?;

        let stream = open()?.with_progress(progress_to_tracker(file_id, Arc::clone(tracker)));
        let stats = self.index_source(file_id, stream, cancel)?;

        if stats.rows_skipped > 0 {
            tracker.record_skipped(file_id, stats.rows_skipped)?;
        }

        let expected = tracker
            .record(file_id)
            .map(|record| record.rows_count)
            .ok_or(StatusError::NotFound(file_id))?;
        let reconciliation = self.sync.verify(file_id, expected)?;
        if !reconciliation.is_consistent() || stats.records_indexed != expected {
            return Err(IngestError::Inconsistent(reconciliation));
        }
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        tracker.advance(file_id, FileStatus::Completed, None)?;
        log_event!(
            "pipeline",
            "completed",
            "file {file_id}: {} rows from {} sheets ({} skipped) in {:?}",
            stats.records_indexed,
            stats.sheets,
            stats.rows_skipped,
            stats.elapsed
        );

        Ok(IngestReport {
            file_id,
            stats,
            reconciliation,
        })
    }

    /// Parse, embed and upsert every record of `stream`. No status updates.
    pub fn index_source(
        &self,
        file_id: FileId,
        stream: RecordStream,
        cancel: &CancellationToken,
    ) -> Result<IngestStats, IngestError> {
        let start = Instant::now();
        let batch_size = self.config.batch_size;

        let (parsed, (indexed, batches)) = thread::scope(|scope| {
            let (batch_tx, batch_rx) = bounded::<BatchMessage>(self.config.channel_capacity);

            let producer = scope.spawn(move || produce(stream, batch_tx, batch_size, cancel));
            let consumed = self.consume(file_id, batch_rx, cancel);

            let parsed = producer
                .join()
                .map_err(|_| IngestError::Worker("parser thread panicked".to_string()))?;
            Ok::<_, IngestError>((parsed, consumed?))
        })?;

        Ok(IngestStats {
            sheets: parsed.sheets,
            records_parsed: parsed.records,
            records_indexed: indexed,
            rows_skipped: parsed.rows_skipped,
            batches,
            elapsed: start.elapsed(),
        })
    }

    /// Embed and index batches until the parser is done. Returns
    /// `(records indexed, batches)`.
    fn consume(
        &self,
        file_id: FileId,
        batches: Receiver<BatchMessage>,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64), IngestError> {
        let mut indexed = 0u64;
        let mut count = 0u64;

        for message in batches {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let batch = message?;
            let vectors = self.embed_batch(&batch)?;
            indexed += self.sync.sync_batch(file_id, batch, vectors)? as u64;
            count += 1;
            debug_event!("pipeline", "batch", "file {file_id}: {indexed} rows indexed");
        }

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        Ok((indexed, count))
    }

    fn embed_batch(&self, batch: &[ParsedRecord]) -> Result<Vec<Vec<f32>>, IngestError> {
        let texts: Vec<String> = batch.iter().map(ParsedRecord::embedding_text).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        retry_embedding(&self.config.embed_retry, || self.embedder.embed(&refs))
    }

    /// Purge the file's documents (when configured) and mark it failed.
    pub fn abandon(&self, file_id: FileId, tracker: &StatusTracker, error: &IngestError) {
        if self.config.purge_on_failure {
            match self.sync.purge(file_id) {
                Ok(removed) if removed > 0 => {
                    debug_event!("pipeline", "purged", "file {file_id}: {removed} documents");
                }
                Ok(_) => {}
                Err(e) => warn_event!("pipeline", "purge failed", "file {file_id}: {e}"),
            }
        }

        let detail = error.detail();
        match tracker.mark_failed(file_id, &detail) {
            Ok(_) => {}
            Err(e) => warn_event!("pipeline", "could not record failure", "file {file_id}: {e}"),
        }
    }
}

fn retry_embedding<F>(policy: &RetryPolicy, embed: F) -> Result<Vec<Vec<f32>>, IngestError>
where
    F: Fn() -> Result<Vec<Vec<f32>>, EmbeddingError>,
{
    policy
        .run("embed", |_| embed(), EmbeddingError::is_transient)
        .map_err(|Exhausted { attempts, error }| IngestError::Embedding {
            attempts,
            source: error,
        })
}

/// Parser side: read batches until the workbook ends, the consumer hangs up,
/// or the ingestion is cancelled.
fn produce(
    mut stream: RecordStream,
    batches: Sender<BatchMessage>,
    batch_size: usize,
    cancel: &CancellationToken,
) -> ParseStats {
    while !cancel.is_cancelled() {
        match stream.next_batch(batch_size) {
            Ok(Some(batch)) => {
                if batches.send(Ok(batch)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = batches.send(Err(e));
                break;
            }
        }
    }
    stream.stats().clone()
}

/// Forward parser progress to the file's status record.
fn progress_to_tracker(file_id: FileId, tracker: Arc<StatusTracker>) -> ProgressFn {
    Arc::new(move |event: &ParseEvent| {
        let result = match event {
            ParseEvent::Rows { delta, .. } => {
                let delta = i64::try_from(*delta).unwrap_or(i64::MAX);
                tracker
                    .advance(file_id, FileStatus::Processing, Some(delta))
                    .map(|_| ())
            }
            ParseEvent::SheetDone { .. } => tracker.record_sheet(file_id),
        };
        if let Err(e) = result {
            warn_event!("pipeline", "progress rejected", "file {file_id}: {e}");
        }
    })
}
