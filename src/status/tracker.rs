use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{FileStatus, StatusError};
use crate::types::FileId;
use crate::{debug_event, log_event};

const INTERRUPTED: &str = "ingestion interrupted by restart";

/// Lifecycle record of one ingested file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub filename: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub status: FileStatus,
    pub rows_count: u64,
    pub sheet_count: u32,
    pub rows_skipped: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Present only when `status` is `failed`.
    pub error: Option<String>,
}

/// What status queries return for a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatusView {
    pub id: FileId,
    pub filename: String,
    pub status: FileStatus,
    pub rows_count: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&FileRecord> for FileStatusView {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id,
            filename: record.filename.clone(),
            status: record.status,
            rows_count: record.rows_count,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
            updated_at: record.updated_at,
            error: record.error.clone(),
        }
    }
}

/// Owner of all [`FileRecord`]s.
///
/// Each record sits behind its own map entry, so writes are atomic per file
/// and files never contend with each other. A read always sees the latest
/// committed write for that file.
#[derive(Debug)]
pub struct StatusTracker {
    records: DashMap<FileId, FileRecord>,
    next_id: AtomicU32,
    snapshot: Option<PathBuf>,
    snapshot_lock: Mutex<()>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// In-memory tracker.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU32::new(1),
            snapshot: None,
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Tracker persisted to a JSON snapshot at `path`.
    ///
    /// Records found non-terminal in an existing snapshot belonged to an
    /// ingestion that did not survive a restart; they are marked failed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StatusError> {
        let path = path.into();
        let mut tracker = Self::new();
        tracker.snapshot = Some(path.clone());

        if path.exists() {
            let data = std::fs::read(&path)?;
            let records: Vec<FileRecord> = serde_json::from_slice(&data)
                .map_err(|e| StatusError::Snapshot(format!("{}: {e}", path.display())))?;

            let mut interrupted = 0;
            let mut max_id = 0;
            for mut record in records {
                if !record.status.is_terminal() {
                    record.status = FileStatus::Failed;
                    record.error = Some(INTERRUPTED.to_string());
                    record.updated_at = Utc::now();
                    interrupted += 1;
                }
                max_id = max_id.max(record.id.value());
                tracker.records.insert(record.id, record);
            }
            tracker.next_id = AtomicU32::new(max_id.saturating_add(1));

            log_event!(
                "status",
                "restored",
                "{} files from {} ({interrupted} interrupted)",
                tracker.records.len(),
                path.display()
            );
            if interrupted > 0 {
                tracker.flush()?;
            }
        }

        Ok(tracker)
    }

    /// Register a new file in `uploaded` state.
    pub fn create(
        &self,
        filename: &str,
        content_type: Option<String>,
        size_bytes: u64,
    ) -> Result<FileId, StatusError> {
        let raw = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = FileId::new(raw).ok_or(StatusError::IdsExhausted)?;
        let now = Utc::now();

        self.records.insert(
            id,
            FileRecord {
                id,
                filename: filename.to_string(),
                content_type,
                size_bytes,
                status: FileStatus::Uploaded,
                rows_count: 0,
                sheet_count: 0,
                rows_skipped: 0,
                created_at: now,
                updated_at: now,
                error: None,
            },
        );
        log_event!("status", "created", "file {id} ({filename}, {size_bytes} bytes)");

        self.flush()?;
        Ok(id)
    }

    /// Move a file to `to`, optionally adding to its row count.
    ///
    /// A negative delta is rejected: the row count only grows.
    pub fn advance(
        &self,
        id: FileId,
        to: FileStatus,
        row_delta: Option<i64>,
    ) -> Result<FileStatusView, StatusError> {
        let view = {
            let mut record = self.records.get_mut(&id).ok_or(StatusError::NotFound(id))?;

            if !record.status.can_transition_to(to) {
                return Err(StatusError::InvalidTransition {
                    file_id: id,
                    from: record.status,
                    to,
                });
            }
            let delta = match row_delta {
                Some(delta) if delta < 0 => {
                    return Err(StatusError::NegativeRowDelta { file_id: id, delta });
                }
                Some(delta) => delta as u64,
                None => 0,
            };

            if record.status != to {
                log_event!("status", "transition", "file {id}: {} -> {to}", record.status);
            }
            record.status = to;
            record.rows_count = record.rows_count.saturating_add(delta);
            record.updated_at = Utc::now();
            FileStatusView::from(&*record)
        };

        if to.is_terminal() {
            self.flush()?;
        }
        Ok(view)
    }

    /// Count one more fully read sheet.
    pub fn record_sheet(&self, id: FileId) -> Result<(), StatusError> {
        self.update_processing(id, |record| record.sheet_count += 1)
    }

    /// Count rows skipped as malformed.
    pub fn record_skipped(&self, id: FileId, rows: u64) -> Result<(), StatusError> {
        self.update_processing(id, |record| record.rows_skipped += rows)
    }

    fn update_processing(
        &self,
        id: FileId,
        apply: impl FnOnce(&mut FileRecord),
    ) -> Result<(), StatusError> {
        let mut record = self.records.get_mut(&id).ok_or(StatusError::NotFound(id))?;
        if record.status != FileStatus::Processing {
            return Err(StatusError::InvalidTransition {
                file_id: id,
                from: record.status,
                to: FileStatus::Processing,
            });
        }
        apply(&mut *record);
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Mark a file failed with a human-readable detail.
    ///
    /// Returns `Ok(false)` if the file had already failed; the first detail
    /// is kept.
    pub fn mark_failed(&self, id: FileId, detail: &str) -> Result<bool, StatusError> {
        {
            let mut record = self.records.get_mut(&id).ok_or(StatusError::NotFound(id))?;
            match record.status {
                FileStatus::Failed => return Ok(false),
                FileStatus::Completed => {
                    return Err(StatusError::InvalidTransition {
                        file_id: id,
                        from: FileStatus::Completed,
                        to: FileStatus::Failed,
                    });
                }
                FileStatus::Uploaded | FileStatus::Processing => {}
            }

            let detail = if detail.trim().is_empty() {
                "ingestion failed"
            } else {
                detail
            };
            tracing::error!("[status] file {id} failed: {detail}");
            record.status = FileStatus::Failed;
            record.error = Some(detail.to_string());
            record.updated_at = Utc::now();
        }

        self.flush()?;
        Ok(true)
    }

    pub fn get(&self, id: FileId) -> Option<FileStatusView> {
        self.records.get(&id).map(|r| FileStatusView::from(r.value()))
    }

    pub fn record(&self, id: FileId) -> Option<FileRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// All files, oldest first.
    pub fn list(&self) -> Vec<FileStatusView> {
        let mut views: Vec<FileStatusView> = self
            .records
            .iter()
            .map(|r| FileStatusView::from(r.value()))
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    /// Fail every non-terminal file without an update for `max_idle`.
    pub fn fail_stalled(&self, max_idle: Duration) -> Result<Vec<FileId>, StatusError> {
        let Ok(max_idle_delta) = chrono::Duration::from_std(max_idle) else {
            return Ok(Vec::new());
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_idle_delta) else {
            return Ok(Vec::new());
        };

        let stalled: Vec<FileId> = self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal() && r.updated_at <= cutoff)
            .map(|r| r.id)
            .collect();

        let detail = format!(
            "ingestion stalled: no progress for {}s",
            max_idle.as_secs()
        );
        let mut failed = Vec::with_capacity(stalled.len());
        for id in stalled {
            if self.mark_failed(id, &detail)? {
                failed.push(id);
            }
        }
        Ok(failed)
    }

    /// Drop a terminal record.
    pub fn remove(&self, id: FileId) -> Result<FileRecord, StatusError> {
        let (_, record) = self
            .records
            .remove_if(&id, |_, r| r.status.is_terminal())
            .ok_or_else(|| {
                if self.records.contains_key(&id) {
                    StatusError::Busy(id)
                } else {
                    StatusError::NotFound(id)
                }
            })?;
        debug_event!("status", "removed", "file {id}");
        self.flush()?;
        Ok(record)
    }

    /// Write the snapshot, if the tracker is persisted.
    pub fn flush(&self) -> Result<(), StatusError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let _guard = self.snapshot_lock.lock();

        let mut records: Vec<FileRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        write_atomic(path, &records)
    }
}

fn write_atomic(path: &Path, records: &[FileRecord]) -> Result<(), StatusError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_vec_pretty(records)
        .map_err(|e| StatusError::Snapshot(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StatusError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn tracker_with_file() -> (StatusTracker, FileId) {
        let tracker = StatusTracker::new();
        let id = tracker.create("parts.xlsx", None, 1024).unwrap();
        (tracker, id)
    }

    #[test]
    fn test_create_assigns_unique_ids() {
        let tracker = StatusTracker::new();
        let a = tracker.create("a.csv", None, 1).unwrap();
        let b = tracker.create("b.csv", None, 1).unwrap();
        assert_ne!(a, b);

        let view = tracker.get(a).unwrap();
        assert_eq!(view.status, FileStatus::Uploaded);
        assert_eq!(view.rows_count, 0);
        assert!(view.error.is_none());
    }

    #[test]
    fn test_lifecycle_to_completed() {
        let (tracker, id) = tracker_with_file();
        tracker.advance(id, FileStatus::Processing, None).unwrap();
        tracker.advance(id, FileStatus::Processing, Some(500)).unwrap();
        tracker.advance(id, FileStatus::Processing, Some(250)).unwrap();
        let view = tracker.advance(id, FileStatus::Completed, None).unwrap();

        assert_eq!(view.status, FileStatus::Completed);
        assert_eq!(view.rows_count, 750);
        assert_eq!(tracker.get(id).unwrap(), view);
    }

    #[test]
    fn test_negative_delta_rejected() {
        let (tracker, id) = tracker_with_file();
        tracker.advance(id, FileStatus::Processing, Some(10)).unwrap();

        let err = tracker
            .advance(id, FileStatus::Processing, Some(-1))
            .unwrap_err();
        assert!(matches!(err, StatusError::NegativeRowDelta { delta: -1, .. }));
        assert_eq!(tracker.get(id).unwrap().rows_count, 10);
    }

    #[test]
    fn test_terminal_status_never_regresses() {
        let (tracker, id) = tracker_with_file();
        tracker.advance(id, FileStatus::Processing, Some(3)).unwrap();
        tracker.advance(id, FileStatus::Completed, None).unwrap();

        for to in [FileStatus::Uploaded, FileStatus::Processing, FileStatus::Failed] {
            assert!(tracker.advance(id, to, None).is_err());
        }
        assert!(tracker.advance(id, FileStatus::Completed, Some(1)).is_err());
        assert!(tracker.mark_failed(id, "late failure").is_err());

        let view = tracker.get(id).unwrap();
        assert_eq!(view.status, FileStatus::Completed);
        assert_eq!(view.rows_count, 3);
    }

    #[test]
    fn test_mark_failed_is_idempotent() {
        let (tracker, id) = tracker_with_file();
        tracker.advance(id, FileStatus::Processing, None).unwrap();

        assert!(tracker.mark_failed(id, "index unavailable").unwrap());
        assert!(!tracker.mark_failed(id, "second reason").unwrap());

        let view = tracker.get(id).unwrap();
        assert_eq!(view.status, FileStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("index unavailable"));
    }

    #[test]
    fn test_sheet_and_skip_counters_require_processing() {
        let (tracker, id) = tracker_with_file();
        assert!(tracker.record_sheet(id).is_err());

        tracker.advance(id, FileStatus::Processing, None).unwrap();
        tracker.record_sheet(id).unwrap();
        tracker.record_sheet(id).unwrap();
        tracker.record_skipped(id, 4).unwrap();

        let record = tracker.record(id).unwrap();
        assert_eq!(record.sheet_count, 2);
        assert_eq!(record.rows_skipped, 4);
    }

    #[test]
    fn test_list_ordered_by_creation() {
        let tracker = StatusTracker::new();
        let ids: Vec<_> = (0..5)
            .map(|i| tracker.create(&format!("f{i}.csv"), None, 1).unwrap())
            .collect();
        let listed: Vec<_> = tracker.list().into_iter().map(|v| v.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_concurrent_progress_is_not_lost() {
        let tracker = Arc::new(StatusTracker::new());
        let a = tracker.create("a.csv", None, 1).unwrap();
        let b = tracker.create("b.csv", None, 1).unwrap();
        tracker.advance(a, FileStatus::Processing, None).unwrap();
        tracker.advance(b, FileStatus::Processing, None).unwrap();

        std::thread::scope(|s| {
            for id in [a, b, a, b] {
                let tracker = Arc::clone(&tracker);
                s.spawn(move || {
                    for _ in 0..1000 {
                        tracker.advance(id, FileStatus::Processing, Some(1)).unwrap();
                    }
                });
            }
        });

        assert_eq!(tracker.get(a).unwrap().rows_count, 2000);
        assert_eq!(tracker.get(b).unwrap().rows_count, 2000);
    }

    #[test]
    fn test_fail_stalled() {
        let (tracker, id) = tracker_with_file();
        let done = tracker.create("done.csv", None, 1).unwrap();
        tracker.advance(done, FileStatus::Processing, None).unwrap();
        tracker.advance(done, FileStatus::Completed, None).unwrap();

        let failed = tracker.fail_stalled(Duration::ZERO).unwrap();
        assert_eq!(failed, vec![id]);
        assert!(tracker.get(id).unwrap().error.unwrap().contains("stalled"));
        assert_eq!(tracker.get(done).unwrap().status, FileStatus::Completed);
    }

    #[test]
    fn test_remove_only_terminal() {
        let (tracker, id) = tracker_with_file();
        assert!(matches!(tracker.remove(id), Err(StatusError::Busy(_))));

        tracker.mark_failed(id, "bad file").unwrap();
        let removed = tracker.remove(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(tracker.get(id).is_none());
        assert!(matches!(tracker.remove(id), Err(StatusError::NotFound(_))));
    }

    #[test]
    fn test_snapshot_restore_fails_interrupted_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("files.json");

        let (done, running) = {
            let tracker = StatusTracker::open(&path).unwrap();
            let done = tracker.create("done.csv", None, 10).unwrap();
            tracker.advance(done, FileStatus::Processing, Some(7)).unwrap();
            tracker.advance(done, FileStatus::Completed, None).unwrap();

            let running = tracker.create("running.csv", None, 10).unwrap();
            tracker.advance(running, FileStatus::Processing, Some(3)).unwrap();
            tracker.flush().unwrap();
            (done, running)
        };

        let restored = StatusTracker::open(&path).unwrap();
        let done_view = restored.get(done).unwrap();
        assert_eq!(done_view.status, FileStatus::Completed);
        assert_eq!(done_view.rows_count, 7);

        let running_view = restored.get(running).unwrap();
        assert_eq!(running_view.status, FileStatus::Failed);
        assert_eq!(running_view.error.as_deref(), Some(INTERRUPTED));

        let next = restored.create("next.csv", None, 1).unwrap();
        assert!(next > running);
    }
}
