//! Async entry point for the ingestion core.
//!
//! [`IngestService`] is what a transport layer (HTTP handlers, the CLI) holds.
//! It admits uploads, stages them to disk, runs each file's pipeline on the
//! blocking pool and answers status and search requests. Files are ingested
//! concurrently; nothing serializes one file behind another.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Settings;
use crate::embedding::{EmbeddingError, SharedEmbedder};
use crate::index::{IndexError, IndexSyncError, Reconciliation, SearchIndex, SearchPage, TantivyIndex};
use crate::intake::{
    ChunkDecision, ChunkNegotiator, ChunkPosition, ChunkProgress, IntakeDecision, IntakeError,
    SessionTicket, UploadSessionManager,
};
use crate::error::IngestError;
use crate::pipeline::IngestPipeline;
use crate::query::{QueryError, QueryService, SearchRequest};
use crate::status::{FileStatusView, StatusError, StatusTracker};
use crate::types::FileId;
use crate::{debug_event, log_event, warn_event};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    IndexSync(#[from] IndexSyncError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Worker(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Answer to a single-request upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SubmitOutcome {
    /// Accepted and processing in the background.
    Accepted(FileStatusView),
    /// Too large for one request; nothing was read.
    ChunkedRequired(ChunkDecision),
}

/// Answer to one uploaded chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ChunkOutcome {
    Partial { received: u64, remaining: u64 },
    /// The last chunk arrived; the file is now ingesting.
    Accepted { file: FileStatusView },
}

#[derive(Clone)]
pub struct IngestService {
    settings: Arc<Settings>,
    tracker: Arc<StatusTracker>,
    sessions: Arc<UploadSessionManager>,
    pipeline: Arc<IngestPipeline>,
    query: QueryService,
    /// Cancellation tokens of running ingestions.
    running: Arc<DashMap<FileId, CancellationToken>>,
    handles: Arc<DashMap<FileId, JoinHandle<()>>>,
}

impl IngestService {
    /// Open the on-disk status snapshot and index under `settings`.
    pub fn open(settings: Settings) -> ServiceResult<Self> {
        std::fs::create_dir_all(&settings.data_dir)?;
        let tracker = Arc::new(StatusTracker::open(settings.status_snapshot_path())?);
        let index: Arc<dyn SearchIndex> = Arc::new(TantivyIndex::open(
            &settings.index_path,
            settings.index.writer_heap_bytes,
        )?);
        let embedder = Arc::new(SharedEmbedder::from_config(
            &settings.embedding,
            &settings.data_dir,
        )?);
        Ok(Self::with_components(settings, tracker, index, embedder))
    }

    pub fn with_components(
        settings: Settings,
        tracker: Arc<StatusTracker>,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<SharedEmbedder>,
    ) -> Self {
        let sessions = UploadSessionManager::new(
            ChunkNegotiator::from_config(&settings.intake),
            settings.staging_dir(),
            Duration::from_secs(settings.intake.session_ttl_secs),
        );
        let pipeline =
            IngestPipeline::with_settings(&settings, Arc::clone(&embedder), Arc::clone(&index));
        let query = QueryService::new(index, embedder, settings.query.clone());

        Self {
            settings: Arc::new(settings),
            tracker,
            sessions: Arc::new(sessions),
            pipeline: Arc::new(pipeline),
            query,
            running: Arc::new(DashMap::new()),
            handles: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    pub fn negotiate(&self, declared_size: u64) -> ServiceResult<IntakeDecision> {
        Ok(self.sessions.negotiator().negotiate(declared_size)?)
    }

    /// Single-request upload.
    ///
    /// Uploads at or above the chunk threshold are answered with a
    /// [`ChunkDecision`] without reading `body`. Smaller ones are staged to
    /// disk, checked against `declared_size` and handed to the pipeline.
    pub async fn submit<R>(
        &self,
        filename: &str,
        content_type: Option<String>,
        declared_size: u64,
        body: R,
    ) -> ServiceResult<SubmitOutcome>
    where
        R: AsyncRead + Unpin,
    {
        if let IntakeDecision::Chunked(decision) = self.negotiate(declared_size)? {
            debug_event!("service", "chunking required", "{filename}: {declared_size} bytes");
            return Ok(SubmitOutcome::ChunkedRequired(decision));
        }

        let staged = stage_body(&self.settings.staging_dir(), filename, declared_size, body).await?;
        let file = self.start_ingestion(filename, content_type, declared_size, staged)?;
        Ok(SubmitOutcome::Accepted(file))
    }

    /// Ingest a file already on disk. The file is copied to staging first.
    pub async fn submit_path(&self, path: &Path) -> ServiceResult<FileStatusView> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload")
            .to_string();
        let size = tokio::fs::metadata(path).await?.len();
        if size == 0 {
            return Err(IntakeError::Empty.into());
        }
        let source = tokio::fs::File::open(path).await?;
        let staged = stage_body(&self.settings.staging_dir(), &filename, size, source).await?;
        self.start_ingestion(&filename, None, size, staged)
    }

    pub fn begin_chunked_upload(
        &self,
        filename: &str,
        content_type: Option<String>,
        declared_size: u64,
    ) -> ServiceResult<SessionTicket> {
        Ok(self.sessions.begin(filename, content_type, declared_size)?)
    }

    /// Append one chunk. The last chunk starts ingestion of the reassembled file.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        position: ChunkPosition,
        data: Vec<u8>,
    ) -> ServiceResult<ChunkOutcome> {
        let sessions = Arc::clone(&self.sessions);
        let session = session_id.to_string();
        let progress = tokio::task::spawn_blocking(move || sessions.accept(&session, position, &data))
            .await
            .map_err(|e| ServiceError::Worker(e.to_string()))??;

        match progress {
            ChunkProgress::Partial {
                received,
                remaining,
            } => Ok(ChunkOutcome::Partial {
                received,
                remaining,
            }),
            ChunkProgress::Complete(upload) => {
                let filename = upload.filename.clone();
                let content_type = upload.content_type.clone();
                let size = upload.size_bytes;
                let file =
                    self.start_ingestion(&filename, content_type, size, upload.into_tempfile())?;
                Ok(ChunkOutcome::Accepted { file })
            }
        }
    }

    pub fn abort_upload(&self, session_id: &str) -> bool {
        self.sessions.abort(session_id)
    }

    pub fn active_uploads(&self) -> usize {
        self.sessions.active_sessions()
    }

    fn start_ingestion(
        &self,
        filename: &str,
        content_type: Option<String>,
        size_bytes: u64,
        staged: NamedTempFile,
    ) -> ServiceResult<FileStatusView> {
        let id = self.tracker.create(filename, content_type, size_bytes)?;
        let cancel = CancellationToken::new();
        self.running.insert(id, cancel.clone());

        let pipeline = Arc::clone(&self.pipeline);
        let tracker = Arc::clone(&self.tracker);
        let running = Arc::clone(&self.running);
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                pipeline.run(id, staged.path(), &tracker, &cancel)
            }));
            drop(staged);
            running.remove(&id);
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug_event!("service", "ingestion ended", "file {id}: {e}"),
                Err(payload) => {
                    let error = IngestError::Worker(format!("panicked: {}", panic_message(&*payload)));
                    warn_event!("service", "ingestion worker panicked", "file {id}: {error}");
                    pipeline.abandon(id, &tracker, &error);
                }
            }
        });
        self.handles.insert(id, handle);

        log_event!("service", "accepted", "file {id}: {filename} ({size_bytes} bytes)");
        self.tracker
            .get(id)
            .ok_or_else(|| StatusError::NotFound(id).into())
    }

    pub fn status(&self, id: FileId) -> Option<FileStatusView> {
        self.tracker.get(id)
    }

    /// All files, oldest first.
    pub fn list(&self) -> Vec<FileStatusView> {
        self.tracker.list()
    }

    /// Request cancellation. Returns false if the file is not ingesting.
    pub fn cancel(&self, id: FileId) -> bool {
        match self.running.get(&id) {
            Some(token) => {
                token.cancel();
                log_event!("service", "cancel requested", "file {id}");
                true
            }
            None => false,
        }
    }

    /// Wait for a file's ingestion to finish and return its final status.
    pub async fn wait(&self, id: FileId) -> ServiceResult<FileStatusView> {
        if let Some((_, handle)) = self.handles.remove(&id) {
            if let Err(e) = handle.await {
                let detail = format!("ingestion worker failed: {e}");
                self.running.remove(&id);
                self.tracker.mark_failed(id, &detail)?;
            }
        }
        self.tracker
            .get(id)
            .ok_or_else(|| StatusError::NotFound(id).into())
    }

    /// Remove a finished file: its documents first, then its record.
    pub async fn delete_file(&self, id: FileId) -> ServiceResult<u64> {
        let record = self.tracker.record(id).ok_or(StatusError::NotFound(id))?;
        if !record.status.is_terminal() || self.running.contains_key(&id) {
            return Err(StatusError::Busy(id).into());
        }

        let pipeline = Arc::clone(&self.pipeline);
        let removed = tokio::task::spawn_blocking(move || pipeline.synchronizer().purge(id))
            .await
            .map_err(|e| ServiceError::Worker(e.to_string()))??;
        self.tracker.remove(id)?;
        self.handles.remove(&id);

        log_event!("service", "deleted", "file {id}: {removed} documents");
        Ok(removed)
    }

    pub async fn search(&self, request: SearchRequest) -> ServiceResult<SearchPage> {
        let query = self.query.clone();
        let page = tokio::task::spawn_blocking(move || query.search(&request))
            .await
            .map_err(|e| ServiceError::Worker(e.to_string()))??;
        Ok(page)
    }

    /// Compare a file's row count with what the index holds for it.
    pub async fn verify(&self, id: FileId) -> ServiceResult<Reconciliation> {
        let record = self.tracker.record(id).ok_or(StatusError::NotFound(id))?;
        let pipeline = Arc::clone(&self.pipeline);
        let report = tokio::task::spawn_blocking(move || {
            pipeline.synchronizer().verify(id, record.rows_count)
        })
        .await
        .map_err(|e| ServiceError::Worker(e.to_string()))??;
        Ok(report)
    }

    /// Fail files that made no progress for `max_idle` and stop their workers.
    pub fn fail_stalled(&self, max_idle: Duration) -> ServiceResult<Vec<FileId>> {
        let failed = self.tracker.fail_stalled(max_idle)?;
        for id in &failed {
            if let Some(token) = self.running.get(id) {
                token.cancel();
            }
        }
        if !failed.is_empty() {
            warn_event!("service", "stalled files failed", "{failed:?}");
        }
        Ok(failed)
    }

    /// Periodically drop idle upload sessions until `shutdown` fires.
    pub fn spawn_session_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let handles = Arc::clone(&self.handles);
        let period = Duration::from_secs(self.settings.intake.reap_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = sessions.cleanup_expired();
                        if expired > 0 {
                            log_event!("service", "sessions reaped", "{expired}");
                        }
                        handles.retain(|_, handle| !handle.is_finished());
                    }
                }
            }
            debug_event!("service", "reaper stopped");
        })
    }
}

/// Copy an upload body into a spool file, enforcing the declared size.
async fn stage_body<R>(
    staging_dir: &Path,
    filename: &str,
    declared_size: u64,
    body: R,
) -> ServiceResult<NamedTempFile>
where
    R: AsyncRead + Unpin,
{
    let staged = crate::intake::spool_file(staging_dir, filename)?;
    let mut out = tokio::fs::File::from_std(staged.as_file().try_clone()?);

    // One extra byte is enough to detect an oversized body.
    let mut limited = body.take(declared_size.saturating_add(1));
    let copied = tokio::io::copy(&mut limited, &mut out).await?;
    out.flush().await?;

    if copied == 0 {
        return Err(IntakeError::Empty.into());
    }
    if copied != declared_size {
        return Err(IntakeError::SizeMismatch {
            filename: filename.to_string(),
            declared: declared_size,
            actual: copied,
        }
        .into());
    }
    Ok(staged)
}
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown cause".to_string()
    }
}
