//! Download task identity, status machine and progress bookkeeping.
//!
//! A [`DownloadTask`] is shared as `Arc<DownloadTask>` between the queue loop,
//! its segment workers and observers. All mutable state sits behind one
//! `std::sync::Mutex` that is only held for short, non-async sections.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::client::ProbeResult;
use super::segment::{Segment, SegmentStatus, plan_segments};
use crate::events::TaskEvent;
use crate::throttle::Throttler;

/// Unique, immutable task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(Self)
    }
}

/// Status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet enqueued.
    New,
    /// Waiting for a transfer slot.
    Queued,
    /// Admitted; probing the server and preparing the file.
    Connecting,
    /// Segment workers are transferring bytes.
    Downloading,
    /// Stopped by the user; resumable.
    Paused,
    /// Every byte is on disk at the final path.
    Completed,
    /// A segment exhausted its retries or the file could not be written.
    Failed,
    /// Stopped by the user; terminal.
    Canceled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::New,
        Self::Queued,
        Self::Connecting,
        Self::Downloading,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
    ];

    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Connecting => "connecting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Completed, Failed and Canceled are terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Connecting and Downloading occupy a transfer slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Downloading)
    }

    /// Whether `self -> next` is an allowed transition.
    ///
    /// `Failed | Canceled -> Queued` is allowed here but only reachable through
    /// an explicit restart.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use TaskStatus::{Canceled, Completed, Connecting, Downloading, Failed, New, Paused, Queued};
        match (*self, next) {
            (New, Queued)
            | (Queued, Connecting | Paused)
            | (Connecting, Downloading | Paused | Failed)
            | (Downloading, Paused | Completed | Failed)
            | (Paused, Queued)
            | (Failed | Canceled, Queued) => true,
            (from, Canceled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "queued" => Ok(Self::Queued),
            "connecting" => Ok(Self::Connecting),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// Errors from task state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The requested change is not allowed from the current status.
    #[error("task {id}: cannot go from {from} to {to}")]
    InvalidTransition {
        /// Task that rejected the change.
        id: TaskId,
        /// Status at the time of the request.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
}

/// Per-task options chosen at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Overrides the filename derived from the server.
    pub filename: Option<String>,
    /// Requested segment count (resumable servers only).
    pub segments: usize,
    /// Per-task limit in bytes per second.
    pub speed_limit: Option<u64>,
    /// Lowercase hex SHA-256 the finished file must match.
    pub expected_sha256: Option<String>,
}

/// Progress reloaded from the task store.
#[derive(Debug, Clone, Default)]
pub(crate) struct RestoredProgress {
    pub status: Option<TaskStatus>,
    pub filename: Option<String>,
    pub final_path: Option<PathBuf>,
    pub total_size: Option<u64>,
    pub resumable: bool,
    pub segments: Vec<Segment>,
    pub error: Option<String>,
}

/// Point-in-time copy of a task for display and serialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Source URL.
    pub url: String,
    /// Destination directory.
    pub destination: PathBuf,
    /// Resolved filename, once known.
    pub filename: Option<String>,
    /// Final file path, once resolved.
    pub path: Option<PathBuf>,
    /// Current status.
    pub status: TaskStatus,
    /// Total size, if known.
    pub total_size: Option<u64>,
    /// Bytes on disk.
    pub downloaded: u64,
    /// Whether the server honors ranges.
    pub resumable: bool,
    /// Segment layout and progress.
    pub segments: Vec<Segment>,
    /// Bytes per second over the last sample window.
    pub speed: f64,
    /// Bytes per second over the time spent downloading.
    pub average_speed: f64,
    /// Per-task limit.
    pub speed_limit: Option<u64>,
    /// Last failure.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First admission.
    pub started_at: Option<DateTime<Utc>>,
    /// Reaching a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Fraction done in `[0, 1]`, when the size is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> Option<f64> {
        match self.total_size {
            Some(0) => Some(if self.status == TaskStatus::Completed { 1.0 } else { 0.0 }),
            Some(total) => Some((self.downloaded as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

#[derive(Debug)]
struct SpeedMeter {
    last_bytes: u64,
    last_at: Instant,
    current: f64,
    active: Duration,
    transferred: u64,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            last_bytes: 0,
            last_at: Instant::now(),
            current: 0.0,
            active: Duration::ZERO,
            transferred: 0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self, now: Instant, downloaded: u64, downloading: bool) {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed.is_zero() {
            return;
        }
        self.current = if downloading {
            downloaded.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        if downloading {
            self.active += elapsed;
        }
        self.last_bytes = downloaded;
        self.last_at = now;
    }

    #[allow(clippy::cast_precision_loss)]
    fn average(&self) -> f64 {
        if self.active.is_zero() {
            0.0
        } else {
            self.transferred as f64 / self.active.as_secs_f64()
        }
    }
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    filename: Option<String>,
    final_path: Option<PathBuf>,
    total_size: Option<u64>,
    resumable: bool,
    segments: Vec<Segment>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    speed_limit: Option<u64>,
    speed: SpeedMeter,
    queue_seq: u64,
    cancel: Option<CancellationToken>,
}

impl TaskState {
    fn downloaded(&self) -> u64 {
        self.segments.iter().map(Segment::downloaded).sum()
    }
}

/// One URL-to-file transfer split into byte-range segments.
#[derive(Debug)]
pub struct DownloadTask {
    id: TaskId,
    url: Url,
    destination: PathBuf,
    requested_filename: Option<String>,
    segment_count: usize,
    expected_sha256: Option<String>,
    created_at: DateTime<Utc>,
    throttle: Throttler,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
    events: broadcast::Sender<TaskEvent>,
}

impl DownloadTask {
    /// Creates a task in status `New`.
    #[must_use]
    pub fn new(
        id: TaskId,
        url: Url,
        destination: impl Into<PathBuf>,
        options: TaskOptions,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::New);
        let throttle = Throttler::new(options.speed_limit.unwrap_or(0), 0);
        Self {
            id,
            url,
            destination: destination.into(),
            requested_filename: options.filename.clone(),
            segment_count: options.segments.max(1),
            expected_sha256: options.expected_sha256.map(|h| h.trim().to_ascii_lowercase()),
            created_at: Utc::now(),
            throttle,
            state: Mutex::new(TaskState {
                status: TaskStatus::New,
                filename: options.filename,
                final_path: None,
                total_size: None,
                resumable: false,
                segments: Vec::new(),
                error: None,
                started_at: None,
                finished_at: None,
                speed_limit: options.speed_limit,
                speed: SpeedMeter::new(),
                queue_seq: 0,
                cancel: None,
            }),
            status_tx,
            events,
        }
    }

    /// Rebuilds a task from persisted progress.
    pub(crate) fn restore(
        id: TaskId,
        url: Url,
        destination: impl Into<PathBuf>,
        options: TaskOptions,
        restored: RestoredProgress,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let task = Self::new(id, url, destination, options, events);
        {
            let mut state = task.lock();
            let status = restored.status.unwrap_or(TaskStatus::New);
            state.status = status;
            if restored.filename.is_some() {
                state.filename = restored.filename;
            }
            state.final_path = restored.final_path;
            state.total_size = restored.total_size;
            state.resumable = restored.resumable;
            state.segments = restored.segments;
            state.error = restored.error;
            state.speed.last_bytes = state.downloaded();
            task.status_tx.send_replace(status);
        }
        task
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the status and notifies observers. Callers hold the state lock so
    /// observers see changes in order.
    fn set_status(&self, state: &mut TaskState, status: TaskStatus) {
        debug!(task_id = %self.id, from = %state.status, to = %status, "status change");
        state.status = status;
        if status.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        self.status_tx.send_replace(status);
        let _ = self.events.send(TaskEvent::StatusChanged {
            id: self.id,
            status,
        });
    }

    fn invalid(&self, from: TaskStatus, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id,
            from,
            to,
        }
    }

    // ==================== Accessors ====================

    /// Task id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Source URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Destination directory.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Filename passed at creation, if any.
    #[must_use]
    pub fn requested_filename(&self) -> Option<&str> {
        self.requested_filename.as_deref()
    }

    /// Segment count requested at creation.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    /// Expected SHA-256, lowercase hex.
    #[must_use]
    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// Resolved filename.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        self.lock().filename.clone()
    }

    /// Final file path, once resolved.
    #[must_use]
    pub fn final_path(&self) -> Option<PathBuf> {
        self.lock().final_path.clone()
    }

    /// Total size, if known.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        self.lock().total_size
    }

    /// Sum of the segments' downloaded bytes.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        self.lock().downloaded()
    }

    /// Whether the server honors ranges.
    #[must_use]
    pub fn resumable(&self) -> bool {
        self.lock().resumable
    }

    /// Copy of the segment layout.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        self.lock().segments.clone()
    }

    /// Last failure message.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Per-task limit in bytes per second.
    #[must_use]
    pub fn speed_limit(&self) -> Option<u64> {
        self.lock().speed_limit
    }

    /// Changes the per-task limit; running workers pick it up immediately.
    pub fn set_speed_limit(&self, limit: Option<u64>) {
        let limit = limit.filter(|l| *l > 0);
        self.lock().speed_limit = limit;
        self.throttle.set_max_bandwidth(limit.unwrap_or(0));
    }

    pub(crate) fn throttle(&self) -> &Throttler {
        &self.throttle
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Consistent copy of the task's state.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.lock();
        TaskSnapshot {
            id: self.id,
            url: self.url.to_string(),
            destination: self.destination.clone(),
            filename: state.filename.clone(),
            path: state.final_path.clone(),
            status: state.status,
            total_size: state.total_size,
            downloaded: state.downloaded(),
            resumable: state.resumable,
            segments: state.segments.clone(),
            speed: state.speed.current,
            average_speed: state.speed.average(),
            speed_limit: state.speed_limit,
            error: state.error.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    // ==================== User Operations ====================

    /// Pauses a queued or transferring task, stopping its workers.
    ///
    /// Returns `Ok(false)` when the task is already paused.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] from New or a terminal status.
    pub fn pause(&self) -> Result<bool, TaskError> {
        let mut state = self.lock();
        match state.status {
            TaskStatus::Paused => Ok(false),
            from if from.can_transition_to(TaskStatus::Paused) => {
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                self.set_status(&mut state, TaskStatus::Paused);
                Ok(true)
            }
            from => Err(self.invalid(from, TaskStatus::Paused)),
        }
    }

    /// Moves a paused task back to the queue.
    ///
    /// Returns `Ok(false)` when the task is already queued or transferring.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] from New or a terminal status.
    pub fn resume(&self) -> Result<bool, TaskError> {
        let mut state = self.lock();
        match state.status {
            TaskStatus::Queued | TaskStatus::Connecting | TaskStatus::Downloading => Ok(false),
            TaskStatus::Paused => {
                state.error = None;
                self.set_status(&mut state, TaskStatus::Queued);
                Ok(true)
            }
            from => Err(self.invalid(from, TaskStatus::Queued)),
        }
    }

    /// Cancels the task. The partial file stays on disk.
    ///
    /// Returns `Ok(false)` when the task is already canceled.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] from Completed or Failed.
    pub fn cancel(&self) -> Result<bool, TaskError> {
        let mut state = self.lock();
        match state.status {
            TaskStatus::Canceled => Ok(false),
            from if from.can_transition_to(TaskStatus::Canceled) => {
                if let Some(cancel) = state.cancel.take() {
                    cancel.cancel();
                }
                self.set_status(&mut state, TaskStatus::Canceled);
                Ok(true)
            }
            from => Err(self.invalid(from, TaskStatus::Canceled)),
        }
    }

    /// Re-queues a failed or canceled task from scratch.
    ///
    /// The final path reservation is kept, so the existing `.part` file is
    /// reused and overwritten. Returns `Ok(false)` when already queued.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] from any other status.
    pub fn restart(&self) -> Result<bool, TaskError> {
        let mut state = self.lock();
        match state.status {
            TaskStatus::Queued => Ok(false),
            TaskStatus::Failed | TaskStatus::Canceled => {
                state.segments.clear();
                state.total_size = None;
                state.error = None;
                state.finished_at = None;
                let downloaded = state.downloaded();
                state.speed.last_bytes = downloaded;
                self.set_status(&mut state, TaskStatus::Queued);
                Ok(true)
            }
            from => Err(self.invalid(from, TaskStatus::Queued)),
        }
    }

    // ==================== Queue Hooks ====================

    /// New -> Queued.
    pub(crate) fn enqueue(&self, seq: u64) -> bool {
        let mut state = self.lock();
        if state.status != TaskStatus::New {
            return false;
        }
        state.queue_seq = seq;
        self.set_status(&mut state, TaskStatus::Queued);
        true
    }

    pub(crate) fn queue_seq(&self) -> u64 {
        self.lock().queue_seq
    }

    pub(crate) fn set_queue_seq(&self, seq: u64) {
        self.lock().queue_seq = seq;
    }

    /// Queued -> Connecting, taking ownership of the run's cancellation token.
    pub(crate) fn begin(&self, cancel: CancellationToken) -> bool {
        let mut state = self.lock();
        if state.status != TaskStatus::Queued {
            return false;
        }
        state.cancel = Some(cancel);
        if state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        let now = Instant::now();
        let downloaded = state.downloaded();
        state.speed.last_at = now;
        state.speed.last_bytes = downloaded;
        self.set_status(&mut state, TaskStatus::Connecting);
        true
    }

    /// Samples speed and returns `(downloaded, total, speed)`.
    pub(crate) fn sample_speed(&self, now: Instant) -> (u64, Option<u64>, f64) {
        let mut state = self.lock();
        let downloaded = state.downloaded();
        let downloading = state.status == TaskStatus::Downloading;
        state.speed.sample(now, downloaded, downloading);
        (downloaded, state.total_size, state.speed.current)
    }

    // ==================== Transfer Hooks ====================

    /// Whether the transfer must (re)probe before planning.
    pub(crate) fn needs_probe(&self) -> bool {
        let state = self.lock();
        state.segments.is_empty() || !state.resumable || state.final_path.is_none()
    }

    /// Applies a probe result while still Connecting: fixes the filename and
    /// final path, and plans fresh segments.
    ///
    /// `resolve_path` is only called when no final path was reserved yet.
    pub(crate) fn apply_probe(
        &self,
        probe: &ProbeResult,
        resolve_path: impl FnOnce(&str) -> PathBuf,
    ) -> Option<PathBuf> {
        let mut state = self.lock();
        if state.status != TaskStatus::Connecting {
            return None;
        }
        if state.filename.is_none() {
            state.filename = Some(probe.filename.clone());
        }
        if state.final_path.is_none() {
            let filename = state.filename.clone().unwrap_or_else(|| probe.filename.clone());
            let path = resolve_path(&filename);
            if let Some(name) = path.file_name() {
                state.filename = Some(name.to_string_lossy().into_owned());
            }
            state.final_path = Some(path);
        }
        state.total_size = probe.total_size;
        state.resumable = probe.resumable;
        state.segments = plan_segments(probe.total_size, self.segment_count, probe.resumable);
        let downloaded = state.downloaded();
        state.speed.last_bytes = downloaded;
        state.final_path.clone()
    }

    /// Compare-and-set transition used by the transfer. Pairs outside
    /// [`TaskStatus::can_transition_to`] are refused.
    pub(crate) fn advance(&self, from: TaskStatus, to: TaskStatus) -> bool {
        let mut state = self.lock();
        if state.status != from || !from.can_transition_to(to) {
            return false;
        }
        if to.is_terminal() {
            state.cancel = None;
        }
        self.set_status(&mut state, to);
        true
    }

    /// Connecting | Downloading -> Failed.
    pub(crate) fn fail(&self, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        if !state.status.can_transition_to(TaskStatus::Failed) {
            return false;
        }
        state.error = Some(message.into());
        state.cancel = None;
        for segment in &mut state.segments {
            if segment.status() == SegmentStatus::Active {
                segment.set_status(SegmentStatus::Pending);
            }
        }
        self.set_status(&mut state, TaskStatus::Failed);
        true
    }

    /// Indices of segments that still need bytes.
    pub(crate) fn pending_segments(&self) -> Vec<usize> {
        self.lock()
            .segments
            .iter()
            .filter(|s| !s.is_complete())
            .map(Segment::index)
            .collect()
    }

    /// `(offset, end)` of the next request for a segment.
    pub(crate) fn segment_range(&self, index: usize) -> Option<(u64, Option<u64>)> {
        self.lock()
            .segments
            .get(index)
            .map(|s| (s.offset(), s.end()))
    }

    pub(crate) fn segment_remaining(&self, index: usize) -> Option<u64> {
        self.lock().segments.get(index).and_then(Segment::remaining)
    }

    pub(crate) fn set_segment_status(&self, index: usize, status: SegmentStatus) {
        if let Some(segment) = self.lock().segments.get_mut(index) {
            segment.set_status(status);
        }
    }

    /// Records bytes written for a segment.
    pub(crate) fn record_progress(&self, index: usize, bytes: u64) {
        let mut state = self.lock();
        if let Some(segment) = state.segments.get_mut(index) {
            segment.record(bytes);
            state.speed.transferred += bytes;
        }
    }

    /// Completes an open-ended segment once its stream ended, fixing the size.
    pub(crate) fn finish_open_ended(&self, index: usize) {
        let mut state = self.lock();
        if let Some(segment) = state.segments.get_mut(index) {
            segment.finish_open_ended();
        }
        if state.total_size.is_none() && state.segments.iter().all(Segment::is_complete) {
            state.total_size = Some(state.downloaded());
        }
    }

    /// Returns interrupted segments to Pending.
    pub(crate) fn settle_segments(&self) {
        for segment in &mut self.lock().segments {
            if segment.status() == SegmentStatus::Active {
                segment.set_status(SegmentStatus::Pending);
            }
        }
    }

    /// Whether every segment is complete.
    pub(crate) fn all_segments_complete(&self) -> bool {
        let state = self.lock();
        !state.segments.is_empty() && state.segments.iter().all(Segment::is_complete)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        let (events, _) = broadcast::channel(16);
        DownloadTask::new(
            TaskId::new(1),
            Url::parse("https://example.com/file.bin").unwrap(),
            "/tmp",
            TaskOptions {
                segments: 4,
                ..TaskOptions::default()
            },
            events,
        )
    }

    fn probe(total: u64) -> ProbeResult {
        ProbeResult {
            total_size: Some(total),
            resumable: true,
            filename: "file.bin".to_string(),
        }
    }

    fn admitted(task: &DownloadTask) -> CancellationToken {
        assert!(task.enqueue(1));
        let token = CancellationToken::new();
        assert!(task.begin(token.clone()));
        token
    }

    // ==================== Status Table ====================

    #[test]
    fn test_terminal_states_only_leave_through_restart() {
        for from in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Canceled] {
            for to in TaskStatus::ALL {
                let allowed = from.can_transition_to(to);
                let expected = to == TaskStatus::Queued && from != TaskStatus::Completed;
                assert_eq!(allowed, expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_advance_refuses_pairs_outside_the_table() {
        let task = task();
        admitted(&task);
        assert!(!TaskStatus::Connecting.can_transition_to(TaskStatus::Completed));
        assert!(!task.advance(TaskStatus::Connecting, TaskStatus::Completed));
        assert_eq!(task.status(), TaskStatus::Connecting);

        assert!(task.advance(TaskStatus::Connecting, TaskStatus::Downloading));
        assert!(!task.advance(TaskStatus::Downloading, TaskStatus::Queued));
        assert!(task.advance(TaskStatus::Downloading, TaskStatus::Completed));
        assert!(!task.fail("late error"));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.error().is_none());
    }

    #[test]
    fn test_every_non_terminal_status_can_cancel() {
        for from in TaskStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(TaskStatus::Canceled));
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("cancelled".parse::<TaskStatus>().unwrap(), TaskStatus::Canceled);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_id_parse_accepts_hash_prefix() {
        assert_eq!("#12".parse::<TaskId>().unwrap(), TaskId::new(12));
        assert_eq!(" 7 ".parse::<TaskId>().unwrap(), TaskId::new(7));
    }

    // ==================== Idempotent Operations ====================

    #[test]
    fn test_pause_twice_second_is_noop() {
        let task = task();
        let token = admitted(&task);
        assert!(task.pause().unwrap());
        assert!(token.is_cancelled());
        assert!(!task.pause().unwrap());
        assert_eq!(task.status(), TaskStatus::Paused);
    }

    #[test]
    fn test_resume_running_task_is_noop() {
        let task = task();
        admitted(&task);
        assert!(!task.resume().unwrap());
        assert_eq!(task.status(), TaskStatus::Connecting);
    }

    #[test]
    fn test_cancel_twice_second_is_noop() {
        let task = task();
        admitted(&task);
        assert!(task.cancel().unwrap());
        assert!(!task.cancel().unwrap());
        assert_eq!(task.status(), TaskStatus::Canceled);
    }

    #[test]
    fn test_resume_canceled_is_invalid() {
        let task = task();
        admitted(&task);
        task.cancel().unwrap();
        let err = task.resume().unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                id: TaskId::new(1),
                from: TaskStatus::Canceled,
                to: TaskStatus::Queued,
            }
        );
    }

    #[test]
    fn test_restart_failed_clears_progress() {
        let task = task();
        admitted(&task);
        task.apply_probe(&probe(100), |name| PathBuf::from("/tmp").join(name));
        task.record_progress(0, 10);
        assert!(task.fail("boom"));
        assert!(task.restart().unwrap());
        assert_eq!(task.status(), TaskStatus::Queued);
        assert_eq!(task.downloaded_bytes(), 0);
        assert!(task.error().is_none());
        assert_eq!(task.final_path(), Some(PathBuf::from("/tmp/file.bin")));
    }

    // ==================== Progress ====================

    #[test]
    fn test_apply_probe_plans_segments_and_keeps_requested_name() {
        let (events, _) = broadcast::channel(16);
        let task = DownloadTask::new(
            TaskId::new(2),
            Url::parse("https://example.com/x").unwrap(),
            "/data",
            TaskOptions {
                filename: Some("custom.iso".to_string()),
                segments: 4,
                ..TaskOptions::default()
            },
            events,
        );
        admitted(&task);
        let path = task
            .apply_probe(&probe(1000), |name| PathBuf::from("/data").join(name))
            .unwrap();
        assert_eq!(path, PathBuf::from("/data/custom.iso"));
        assert_eq!(task.segments().len(), 4);
        assert_eq!(task.total_size(), Some(1000));
    }

    #[test]
    fn test_downloaded_is_sum_of_segments() {
        let task = task();
        admitted(&task);
        task.apply_probe(&probe(400), |name| PathBuf::from("/tmp").join(name));
        task.record_progress(0, 50);
        task.record_progress(3, 25);
        assert_eq!(task.downloaded_bytes(), 75);
        let snapshot = task.snapshot();
        assert_eq!(
            snapshot.segments.iter().map(Segment::downloaded).sum::<u64>(),
            snapshot.downloaded
        );
    }

    #[test]
    fn test_apply_probe_after_pause_is_ignored() {
        let task = task();
        admitted(&task);
        task.pause().unwrap();
        assert!(task.apply_probe(&probe(10), |name| PathBuf::from("/tmp").join(name)).is_none());
        assert!(task.segments().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_sampling_only_counts_downloading_time() {
        let task = task();
        admitted(&task);
        task.apply_probe(&probe(10_000), |name| PathBuf::from("/tmp").join(name));
        assert!(task.advance(TaskStatus::Connecting, TaskStatus::Downloading));
        task.sample_speed(Instant::now());

        tokio::time::advance(Duration::from_secs(1)).await;
        task.record_progress(0, 1000);
        let (downloaded, total, speed) = task.sample_speed(Instant::now());
        assert_eq!(downloaded, 1000);
        assert_eq!(total, Some(10_000));
        assert!((speed - 1000.0).abs() < 1.0);
        assert!((task.snapshot().average_speed - 1000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_status_watch_sees_changes() {
        let task = task();
        let mut rx = task.subscribe_status();
        admitted(&task);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), TaskStatus::Connecting);
    }
}
