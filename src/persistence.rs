//! JSON task store.
//!
//! Tasks that are not completed are written as a JSON array of camelCase
//! records. Writes go to a sibling temp file that is renamed over the store,
//! so a crash never leaves a half-written document behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::download::{DownloadTask, RestoredProgress, Segment, TaskId, TaskOptions, TaskStatus};

/// Errors from reading or writing the task store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The store could not be read.
    #[error("failed to read task store '{path}': {source}")]
    Read {
        /// Store path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The store could not be written.
    #[error("failed to write task store '{path}': {source}")]
    Write {
        /// Path being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Records could not be serialized.
    #[error("failed to serialize task records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted progress of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// First byte.
    pub start: u64,
    /// One past the last byte, if known.
    pub end: Option<u64>,
    /// Bytes on disk.
    pub downloaded: u64,
}

/// Persisted form of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Task id.
    pub id: TaskId,
    /// Source URL.
    pub url: String,
    /// Destination directory.
    pub destination_path: PathBuf,
    /// Resolved or requested filename.
    pub filename: Option<String>,
    /// Status when saved.
    pub status: TaskStatus,
    /// Total size, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    /// Segment offsets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentRecord>,
    /// Per-task speed limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit: Option<u64>,
    /// Whether the server honors ranges.
    #[serde(default)]
    pub resumable: bool,
    /// Reserved final path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_path: Option<PathBuf>,
    /// Requested segment count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_count: Option<usize>,
    /// Expected SHA-256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
    /// Whether `filename` was chosen by the user.
    #[serde(default)]
    pub filename_requested: bool,
    /// Last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    /// Captures a task's persistent state.
    #[must_use]
    pub fn from_task(task: &DownloadTask) -> Self {
        let snapshot = task.snapshot();
        Self {
            id: snapshot.id,
            url: snapshot.url,
            destination_path: snapshot.destination,
            filename: snapshot.filename,
            status: snapshot.status,
            total_size: snapshot.total_size,
            segments: snapshot
                .segments
                .iter()
                .map(|s| SegmentRecord {
                    start: s.start(),
                    end: s.end(),
                    downloaded: s.downloaded(),
                })
                .collect(),
            speed_limit: snapshot.speed_limit,
            resumable: snapshot.resumable,
            final_path: snapshot.path,
            segment_count: Some(task.segment_count()),
            expected_sha256: task.expected_sha256().map(ToString::to_string),
            filename_requested: task.requested_filename().is_some(),
            error: snapshot.error,
        }
    }

    /// Status a reloaded task starts in.
    ///
    /// In-flight and paused tasks come back Paused, queued ones Queued;
    /// Failed and Canceled are kept.
    #[must_use]
    pub fn restored_status(&self) -> TaskStatus {
        match self.status {
            TaskStatus::Connecting | TaskStatus::Downloading | TaskStatus::Paused => {
                TaskStatus::Paused
            }
            TaskStatus::New | TaskStatus::Queued => TaskStatus::Queued,
            other => other,
        }
    }

    /// Options the task was created with.
    #[must_use]
    pub fn options(&self, default_segments: usize) -> TaskOptions {
        TaskOptions {
            filename: self.filename.clone().filter(|_| self.filename_requested),
            segments: self.segment_count.unwrap_or(default_segments),
            speed_limit: self.speed_limit,
            expected_sha256: self.expected_sha256.clone(),
        }
    }

    pub(crate) fn progress(&self) -> RestoredProgress {
        // Progress is only trusted when the part file it describes is there.
        let part_exists = self
            .final_path
            .as_deref()
            .is_some_and(|p| crate::download::filename::part_path(p).exists());
        let segments = if self.resumable && part_exists {
            self.segments
                .iter()
                .enumerate()
                .map(|(i, s)| Segment::restored(i, s.start, s.end, s.downloaded))
                .collect()
        } else {
            Vec::new()
        };
        RestoredProgress {
            status: Some(self.restored_status()),
            filename: self.filename.clone(),
            final_path: self.final_path.clone(),
            total_size: self.total_size.filter(|_| !segments.is_empty()),
            resumable: self.resumable,
            segments,
            error: self.error.clone(),
        }
    }
}

/// JSON file holding [`TaskRecord`]s.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TaskStore {
    /// Creates a store backed by `path`. Nothing is read until [`load`](Self::load).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record.
    ///
    /// A missing file is an empty store. A corrupt file is logged and treated
    /// as empty.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Read`] when the file exists but cannot be read.
    pub async fn load(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no task store yet");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        match serde_json::from_str::<Vec<TaskRecord>>(&raw) {
            Ok(records) => {
                debug!(path = %self.path.display(), count = records.len(), "loaded task store");
                Ok(records)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt task store");
                Ok(Vec::new())
            }
        }
    }

    /// Replaces the store with the records `snapshot` returns, skipping
    /// completed tasks.
    ///
    /// `snapshot` runs while the write lock is held, so concurrent saves land
    /// in the order their snapshots were taken.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] when serialization or the write fails.
    pub async fn save(
        &self,
        snapshot: impl FnOnce() -> Vec<TaskRecord>,
    ) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let records = snapshot();
        let kept: Vec<&TaskRecord> = records
            .iter()
            .filter(|r| r.status != TaskStatus::Completed)
            .collect();
        let json = serde_json::to_vec_pretty(&kept)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| PersistenceError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let mut tmp = self.path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| PersistenceError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| PersistenceError::Write {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), count = kept.len(), "saved task store");
        Ok(())
    }
}
