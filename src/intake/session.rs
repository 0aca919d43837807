use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use uuid::Uuid;

use super::{ChunkNegotiator, IntakeError};
use crate::{debug_event, log_event};

/// Where a chunk belongs in the reassembled file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPosition {
    /// Byte offset of the first byte of the chunk.
    Offset(u64),
    /// Zero-based chunk number; every chunk but the last is `max_chunk_size` long.
    Sequence(u32),
}

/// Returned when a chunked session is opened.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub session_id: String,
    pub max_chunk_size: u64,
    pub expected_chunks: u64,
}

/// A fully reassembled upload, staged on disk.
///
/// The staged file is removed when this value (or the temp file taken from
/// it) is dropped.
#[derive(Debug)]
pub struct CompletedUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    file: NamedTempFile,
}

impl CompletedUpload {
    pub(crate) fn new(
        filename: String,
        content_type: Option<String>,
        size_bytes: u64,
        file: NamedTempFile,
    ) -> Self {
        Self {
            filename,
            content_type,
            size_bytes,
            file,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn into_tempfile(self) -> NamedTempFile {
        self.file
    }
}

/// Result of accepting one chunk.
#[derive(Debug)]
pub enum ChunkProgress {
    Partial { received: u64, remaining: u64 },
    Complete(CompletedUpload),
}

#[derive(Debug)]
struct UploadSession {
    filename: String,
    content_type: Option<String>,
    declared_size: u64,
    chunk_size: u64,
    /// Bytes `[0, received)` are on disk.
    received: u64,
    /// Taken when the upload completes.
    spool: Option<NamedTempFile>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Tracks in-flight chunked uploads.
///
/// Sessions are independent: each has its own lock, so chunks for different
/// uploads never contend. Chunk bytes go straight to a spool file.
#[derive(Debug)]
pub struct UploadSessionManager {
    sessions: DashMap<String, Arc<Mutex<UploadSession>>>,
    negotiator: ChunkNegotiator,
    staging_dir: PathBuf,
    ttl: Duration,
}

impl UploadSessionManager {
    pub fn new(negotiator: ChunkNegotiator, staging_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            negotiator,
            staging_dir: staging_dir.into(),
            ttl,
        }
    }

    pub fn negotiator(&self) -> &ChunkNegotiator {
        &self.negotiator
    }

    /// Open a session for an upload of `declared_size` bytes.
    pub fn begin(
        &self,
        filename: &str,
        content_type: Option<String>,
        declared_size: u64,
    ) -> Result<SessionTicket, IntakeError> {
        if declared_size == 0 {
            return Err(IntakeError::Empty);
        }
        if declared_size > self.negotiator.max_upload() {
            return Err(IntakeError::Oversized {
                declared: declared_size,
                limit: self.negotiator.max_upload(),
            });
        }

        let spool = spool_file(&self.staging_dir, filename)?;
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let chunk_size = self.negotiator.max_chunk_size();

        self.sessions.insert(
            session_id.clone(),
            Arc::new(Mutex::new(UploadSession {
                filename: filename.to_string(),
                content_type,
                declared_size,
                chunk_size,
                received: 0,
                spool: Some(spool),
                created_at: now,
                last_activity: now,
            })),
        );

        log_event!(
            "intake",
            "session opened",
            "{session_id} for {filename} ({declared_size} bytes)"
        );

        Ok(SessionTicket {
            session_id,
            max_chunk_size: chunk_size,
            expected_chunks: self.negotiator.expected_chunks(declared_size),
        })
    }

    /// Append a chunk to a session.
    ///
    /// Chunks must arrive in order. A chunk that starts before the received
    /// prefix is a duplicate, one that starts after it leaves a gap; both are
    /// rejected with a retryable error carrying the expected offset.
    pub fn accept(
        &self,
        session_id: &str,
        position: ChunkPosition,
        data: &[u8],
    ) -> Result<ChunkProgress, IntakeError> {
        let entry = self
            .sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| IntakeError::SessionNotFound(session_id.to_string()))?;
        let mut session = entry.lock();

        let offset = match position {
            ChunkPosition::Offset(offset) => offset,
            ChunkPosition::Sequence(seq) => u64::from(seq) * session.chunk_size,
        };
        let len = data.len() as u64;

        if len == 0 {
            return Err(IntakeError::EmptyChunk);
        }
        if len > session.chunk_size {
            return Err(IntakeError::ChunkTooLarge {
                size: len,
                max: session.chunk_size,
            });
        }
        if offset < session.received {
            return Err(IntakeError::DuplicateRange {
                session_id: session_id.to_string(),
                expected: session.received,
                got: offset,
            });
        }
        if offset > session.received {
            return Err(IntakeError::OutOfOrder {
                session_id: session_id.to_string(),
                expected: session.received,
                got: offset,
            });
        }
        let end = offset + len;
        if end > session.declared_size {
            return Err(IntakeError::ExceedsDeclared {
                end,
                declared: session.declared_size,
            });
        }

        {
            let spool = session
                .spool
                .as_mut()
                .ok_or_else(|| IntakeError::SessionNotFound(session_id.to_string()))?;
            // Seek first so a failed partial write is overwritten by the retry
            let file = spool.as_file_mut();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
        }

        session.received = end;
        session.last_activity = Utc::now();

        if end < session.declared_size {
            debug_event!("intake", "chunk", "{session_id} {end}/{}", session.declared_size);
            return Ok(ChunkProgress::Partial {
                received: end,
                remaining: session.declared_size - end,
            });
        }

        let mut spool = session
            .spool
            .take()
            .ok_or_else(|| IntakeError::SessionNotFound(session_id.to_string()))?;
        spool.as_file_mut().flush()?;
        spool.as_file_mut().seek(SeekFrom::Start(0))?;

        let completed = CompletedUpload::new(
            session.filename.clone(),
            session.content_type.clone(),
            session.declared_size,
            spool,
        );
        drop(session);
        self.sessions.remove(session_id);

        log_event!(
            "intake",
            "upload reassembled",
            "{session_id} ({} bytes)",
            completed.size_bytes
        );
        Ok(ChunkProgress::Complete(completed))
    }

    /// Bytes received so far for a session.
    pub fn received(&self, session_id: &str) -> Option<u64> {
        self.sessions.get(session_id).map(|e| e.value().lock().received)
    }

    /// Discard a session and its partial bytes.
    pub fn abort(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            log_event!("intake", "session aborted", "{session_id}");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Remove sessions idle for longer than the configured TTL.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(ttl) else {
            return 0;
        };

        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().last_activity <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for session_id in expired {
            if let Some((_, session)) = self.sessions.remove(&session_id) {
                let session = session.lock();
                log_event!(
                    "intake",
                    "session expired",
                    "{session_id} ({}/{} bytes, opened {})",
                    session.received,
                    session.declared_size,
                    session.created_at.to_rfc3339()
                );
                count += 1;
            }
        }
        count
    }
}

/// Create a spool file in `dir` that keeps the upload's extension, so the
/// parser can pick a reader from the path.
pub(crate) fn spool_file(dir: &Path, filename: &str) -> std::io::Result<NamedTempFile> {
    std::fs::create_dir_all(dir)?;
    let suffix = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();

    tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, ttl: Duration) -> UploadSessionManager {
        UploadSessionManager::new(ChunkNegotiator::new(8, 4, 1024), dir.path(), ttl)
    }

    #[test]
    fn test_reassembles_in_order_chunks() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let ticket = manager.begin("parts.csv", None, 10).unwrap();
        assert_eq!(ticket.max_chunk_size, 4);
        assert_eq!(ticket.expected_chunks, 3);

        let first = manager
            .accept(&ticket.session_id, ChunkPosition::Offset(0), b"abcd")
            .unwrap();
        assert!(matches!(
            first,
            ChunkProgress::Partial {
                received: 4,
                remaining: 6
            }
        ));
        manager
            .accept(&ticket.session_id, ChunkPosition::Sequence(1), b"efgh")
            .unwrap();
        let last = manager
            .accept(&ticket.session_id, ChunkPosition::Offset(8), b"ij")
            .unwrap();

        let ChunkProgress::Complete(upload) = last else {
            panic!("expected completion");
        };
        assert_eq!(upload.size_bytes, 10);
        assert_eq!(upload.path().extension().unwrap(), "csv");

        let mut contents = String::new();
        std::fs::File::open(upload.path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "abcdefghij");
        assert_eq!(manager.active_sessions(), 0);
    }

    #[test]
    fn test_rejects_gap_and_duplicate_with_retryable_errors() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let ticket = manager.begin("parts.xlsx", None, 10).unwrap();

        let gap = manager
            .accept(&ticket.session_id, ChunkPosition::Offset(4), b"efgh")
            .unwrap_err();
        assert!(matches!(gap, IntakeError::OutOfOrder { expected: 0, .. }));
        assert!(gap.is_retryable());

        manager
            .accept(&ticket.session_id, ChunkPosition::Offset(0), b"abcd")
            .unwrap();
        let duplicate = manager
            .accept(&ticket.session_id, ChunkPosition::Sequence(0), b"abcd")
            .unwrap_err();
        assert!(matches!(
            duplicate,
            IntakeError::DuplicateRange { expected: 4, .. }
        ));
        assert!(duplicate.is_retryable());
        assert_eq!(manager.received(&ticket.session_id), Some(4));
    }

    #[test]
    fn test_rejects_chunks_past_declared_size() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let ticket = manager.begin("parts.csv", None, 6).unwrap();

        manager
            .accept(&ticket.session_id, ChunkPosition::Offset(0), b"abcd")
            .unwrap();
        let err = manager
            .accept(&ticket.session_id, ChunkPosition::Offset(4), b"efg")
            .unwrap_err();
        assert!(matches!(err, IntakeError::ExceedsDeclared { end: 7, .. }));
        assert!(!err.is_retryable());

        let err = manager
            .accept(&ticket.session_id, ChunkPosition::Offset(4), b"efghi")
            .unwrap_err();
        assert!(matches!(err, IntakeError::ChunkTooLarge { .. }));
    }

    #[test]
    fn test_unknown_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let err = manager
            .accept("missing", ChunkPosition::Offset(0), b"a")
            .unwrap_err();
        assert!(matches!(err, IntakeError::SessionNotFound(_)));
    }

    #[test]
    fn test_expired_sessions_are_discarded() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::ZERO);
        let ticket = manager.begin("parts.csv", None, 10).unwrap();
        manager
            .accept(&ticket.session_id, ChunkPosition::Offset(0), b"abcd")
            .unwrap();

        assert_eq!(manager.cleanup_expired(), 1);
        assert_eq!(manager.active_sessions(), 0);
        assert!(manager.received(&ticket.session_id).is_none());
    }

    #[test]
    fn test_active_session_survives_cleanup() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(3600));
        manager.begin("parts.csv", None, 10).unwrap();
        assert_eq!(manager.cleanup_expired(), 0);
        assert_eq!(manager.active_sessions(), 1);
    }

    #[test]
    fn test_abort_frees_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Duration::from_secs(60));
        let ticket = manager.begin("parts.csv", None, 10).unwrap();
        assert!(manager.abort(&ticket.session_id));
        assert!(!manager.abort(&ticket.session_id));
    }
}
