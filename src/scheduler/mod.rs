//! Wall-clock scheduling of downloads.
//!
//! Entries fire at their `start_time`. A bound task is started, paused or
//! resumed; an unbound entry submits a new download. Recurring entries then
//! advance from their previous start time, so a scheduler that was asleep
//! catches up on missed runs instead of skipping them. One-time entries are
//! removed after firing.
//!
//! The background loop sleeps until the earliest start time, at most
//! [`IDLE_WAIT`], and is woken early whenever entries change.

mod entry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::download::{TaskId, TaskStatus};
use crate::manager::{DownloadManager, DownloadRequest, ManagerError};
use crate::parser::{ParseError, validate_url};

pub use entry::{Recurrence, ScheduleAction, ScheduleEntry, ScheduleId, ScheduleTarget};

/// Longest sleep of the scheduler loop.
pub const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Errors from schedule management and execution.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No entry with this id.
    #[error("no schedule entry with id {0}")]
    NotFound(ScheduleId),

    /// The bound task does not exist.
    #[error("no download with id {0}")]
    TaskNotFound(TaskId),

    /// A custom interval of zero seconds, or one too large to add to a
    /// timestamp.
    #[error("recurrence interval must be between one second and the representable time range")]
    InvalidRecurrence,

    /// The download URL was rejected.
    #[error(transparent)]
    Url(#[from] ParseError),

    /// The manager refused the action.
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Time-based scheduler driving a [`DownloadManager`].
#[derive(Debug)]
pub struct DownloadScheduler {
    manager: Arc<DownloadManager>,
    entries: Mutex<BTreeMap<ScheduleId, ScheduleEntry>>,
    next_id: AtomicU64,
    wake: Notify,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadScheduler {
    /// Creates an empty scheduler over `manager`. Nothing fires until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(manager: Arc<DownloadManager>) -> Self {
        Self {
            manager,
            entries: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    fn entries_mut(&self) -> MutexGuard<'_, BTreeMap<ScheduleId, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        target: ScheduleTarget,
        action: ScheduleAction,
        start_time: DateTime<Utc>,
        recurrence: Recurrence,
    ) -> Result<ScheduleId, ScheduleError> {
        let unrepresentable =
            recurrence != Recurrence::Once && recurrence.next_after(start_time).is_none();
        if recurrence == Recurrence::Custom(0) || unrepresentable {
            return Err(ScheduleError::InvalidRecurrence);
        }
        let id = ScheduleId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries_mut().insert(
            id,
            ScheduleEntry {
                id,
                target,
                action,
                start_time,
                recurrence,
                active: true,
                last_run: None,
            },
        );
        info!(id = %id, action = %action, start = %start_time, recurrence = %recurrence, "scheduled");
        self.wake.notify_one();
        Ok(id)
    }

    // ==================== Entries ====================

    /// Submits `request` once at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Url`] when the URL is invalid.
    pub fn schedule_download(
        &self,
        request: DownloadRequest,
        at: DateTime<Utc>,
    ) -> Result<ScheduleId, ScheduleError> {
        self.schedule_recurring_download(request, at, Recurrence::Once)
    }

    /// Submits `request` at `at` and then on every recurrence.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Url`] for an invalid URL and
    /// [`ScheduleError::InvalidRecurrence`] for a zero or oversized interval.
    pub fn schedule_recurring_download(
        &self,
        request: DownloadRequest,
        at: DateTime<Utc>,
        recurrence: Recurrence,
    ) -> Result<ScheduleId, ScheduleError> {
        validate_url(&request.url)?;
        self.insert(
            ScheduleTarget::NewDownload { request },
            ScheduleAction::Start,
            at,
            recurrence,
        )
    }

    /// Applies `action` to an existing task at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TaskNotFound`] for unknown tasks and
    /// [`ScheduleError::InvalidRecurrence`] for a zero or oversized interval.
    pub fn schedule_action(
        &self,
        task: TaskId,
        action: ScheduleAction,
        at: DateTime<Utc>,
        recurrence: Recurrence,
    ) -> Result<ScheduleId, ScheduleError> {
        if self.manager.task(task).is_none() {
            return Err(ScheduleError::TaskNotFound(task));
        }
        self.insert(ScheduleTarget::Task { id: task }, action, at, recurrence)
    }

    /// Deletes an entry. Returns false if it did not exist.
    pub fn remove(&self, id: ScheduleId) -> bool {
        let removed = self.entries_mut().remove(&id).is_some();
        if removed {
            debug!(id = %id, "schedule entry removed");
            self.wake.notify_one();
        }
        removed
    }

    /// Enables or disables an entry.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NotFound`] for unknown ids.
    pub fn set_active(&self, id: ScheduleId, active: bool) -> Result<(), ScheduleError> {
        self.entries_mut()
            .get_mut(&id)
            .ok_or(ScheduleError::NotFound(id))?
            .active = active;
        self.wake.notify_one();
        Ok(())
    }

    /// Entry by id.
    #[must_use]
    pub fn get(&self, id: ScheduleId) -> Option<ScheduleEntry> {
        self.entries_mut().get(&id).cloned()
    }

    /// All entries ordered by id.
    #[must_use]
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries_mut().values().cloned().collect()
    }

    /// Earliest start time among active entries.
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries_mut()
            .values()
            .filter(|e| e.active)
            .map(|e| e.start_time)
            .min()
    }

    // ==================== Execution ====================

    /// Fires every active entry whose start time is at or before `now` and
    /// returns how many fired.
    ///
    /// Failures are logged; the entry still advances (or is removed).
    #[instrument(skip(self), fields(now = %now))]
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<ScheduleEntry> = self
            .entries_mut()
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();

        for entry in &due {
            if let Err(e) = self.execute(entry).await {
                warn!(id = %entry.id, error = %e, "scheduled action failed");
            }

            let mut entries = self.entries_mut();
            match entry.recurrence.next_after(entry.start_time) {
                Some(next) => {
                    if let Some(stored) = entries.get_mut(&entry.id) {
                        stored.start_time = next;
                        stored.last_run = Some(now);
                        debug!(id = %entry.id, next = %next, "rescheduled");
                    }
                }
                None => {
                    entries.remove(&entry.id);
                }
            }
        }
        due.len()
    }

    async fn execute(&self, entry: &ScheduleEntry) -> Result<(), ScheduleError> {
        match &entry.target {
            ScheduleTarget::NewDownload { request } => {
                let id = self.manager.add_download(request.clone()).await?;
                info!(entry = %entry.id, task = %id, "scheduled download submitted");
            }
            ScheduleTarget::Task { id } => {
                let id = *id;
                let task = self
                    .manager
                    .task(id)
                    .ok_or(ScheduleError::TaskNotFound(id))?;
                let status = task.status();
                let changed = match (entry.action, status) {
                    (ScheduleAction::Start, TaskStatus::Failed | TaskStatus::Canceled) => {
                        self.manager.restart_download(id)?
                    }
                    (ScheduleAction::Start | ScheduleAction::Resume, TaskStatus::Paused) => {
                        self.manager.resume_download(id)?
                    }
                    (
                        ScheduleAction::Pause,
                        TaskStatus::Queued | TaskStatus::Connecting | TaskStatus::Downloading,
                    ) => self.manager.pause_download(id)?,
                    _ => false,
                };
                info!(
                    entry = %entry.id,
                    task = %id,
                    action = %entry.action,
                    status = %status,
                    changed,
                    "scheduled action applied"
                );
            }
        }
        Ok(())
    }

    // ==================== Loop ====================

    /// Starts the background loop. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        *handle = Some(tokio::spawn(Arc::clone(self).run()));
        info!("scheduler started");
    }

    /// Stops the loop and waits for it.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.run_due(Utc::now()).await;

            let wait = self.next_due().map_or(IDLE_WAIT, |next| {
                (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(IDLE_WAIT)
            });
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
        debug!("scheduler loop exited");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> DownloadScheduler {
        let mut settings = Settings::default();
        settings.general.download_directory = dir.path().to_path_buf();
        let manager = Arc::new(DownloadManager::with_store(settings, None).unwrap());
        DownloadScheduler::new(manager)
    }

    #[tokio::test]
    async fn test_custom_zero_rejected() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let err = s
            .schedule_recurring_download(
                DownloadRequest::new("https://e.com/a"),
                Utc::now(),
                Recurrence::Custom(0),
            )
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidRecurrence));
        assert!(s.entries().is_empty());
    }

    #[tokio::test]
    async fn test_custom_interval_beyond_time_range_rejected() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        for secs in [u64::MAX, u64::try_from(i64::MAX).unwrap()] {
            let err = s
                .schedule_recurring_download(
                    DownloadRequest::new("https://e.com/a"),
                    Utc::now(),
                    Recurrence::Custom(secs),
                )
                .unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidRecurrence), "{secs}");
        }
        assert!(s.entries().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        assert!(matches!(
            s.schedule_download(DownloadRequest::new("nope"), Utc::now()),
            Err(ScheduleError::Url(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_rejected() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let err = s
            .schedule_action(TaskId::new(42), ScheduleAction::Pause, Utc::now(), Recurrence::Once)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_one_time_entry_fires_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let now = Utc::now();
        let id = s
            .schedule_download(DownloadRequest::new("http://127.0.0.1:9/a.bin"), now)
            .unwrap();

        assert_eq!(s.run_due(now - TimeDelta::seconds(1)).await, 0);
        assert_eq!(s.run_due(now).await, 1);
        assert!(s.get(id).is_none());
        assert_eq!(s.manager.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_entry_advances_from_previous_start() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let start = Utc::now() - TimeDelta::hours(5);
        let id = s
            .schedule_recurring_download(
                DownloadRequest::new("http://127.0.0.1:9/a.bin"),
                start,
                Recurrence::Hourly,
            )
            .unwrap();

        let now = Utc::now();
        s.run_due(now).await;
        let entry = s.get(id).unwrap();
        assert_eq!(entry.start_time, start + TimeDelta::hours(1));
        assert_eq!(entry.last_run, Some(now));
    }

    #[tokio::test]
    async fn test_inactive_entries_skipped() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let now = Utc::now();
        let id = s
            .schedule_download(DownloadRequest::new("http://127.0.0.1:9/a.bin"), now)
            .unwrap();
        s.set_active(id, false).unwrap();
        assert_eq!(s.next_due(), None);
        assert_eq!(s.run_due(now).await, 0);
        assert!(s.get(id).is_some());
        assert!(s.remove(id));
        assert!(!s.remove(id));
    }

    #[tokio::test]
    async fn test_pause_action_on_queued_task() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let task = s
            .manager
            .add_download(DownloadRequest::new("http://127.0.0.1:9/a.bin"))
            .await
            .unwrap();
        let now = Utc::now();
        s.schedule_action(task, ScheduleAction::Pause, now, Recurrence::Once)
            .unwrap();
        s.run_due(now).await;
        assert_eq!(s.manager.task(task).unwrap().status(), TaskStatus::Paused);

        s.schedule_action(task, ScheduleAction::Start, now, Recurrence::Once)
            .unwrap();
        s.run_due(now).await;
        assert_eq!(s.manager.task(task).unwrap().status(), TaskStatus::Queued);
    }
}
