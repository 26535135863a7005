//! The download manager façade.
//!
//! [`DownloadManager`] is the single entry point used by the CLI, the batch
//! dispatcher, the crawler and the scheduler. It validates submissions, owns
//! the [`DownloadQueue`], the global [`Throttler`], the live [`Settings`] and
//! the optional [`TaskStore`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dlm_core::{DownloadManager, DownloadRequest, Settings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(DownloadManager::new(Settings::default())?);
//! manager.start();
//! let id = manager
//!     .add_download(DownloadRequest::new("https://example.com/file.zip").segments(8))
//!     .await?;
//! let status = manager.wait_for_download(id).await?;
//! println!("{id}: {status}");
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, Settings};
use crate::download::constants::EVENT_CHANNEL_CAPACITY;
use crate::download::transfer::{PathReservations, TransferContext};
use crate::download::{
    DownloadTask, HttpClient, RetryPolicy, TaskError, TaskId, TaskOptions, TaskSnapshot,
    TaskStatus,
};
use crate::events::TaskEvent;
use crate::parser::{ParseError, validate_url};
use crate::persistence::{PersistenceError, TaskRecord, TaskStore};
use crate::queue::{DownloadQueue, QueueError};
use crate::throttle::Throttler;

/// Errors returned by manager operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The URL is malformed or uses an unsupported scheme.
    #[error(transparent)]
    Url(#[from] ParseError),

    /// The destination directory cannot be created or written.
    #[error("destination '{path}' is not writable: {source}")]
    Destination {
        /// Directory that was rejected.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// No task with this id.
    #[error("no download with id {0}")]
    NotFound(TaskId),

    /// The task rejected the state change.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The task store failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A settings change was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The HTTP client could not be built from the settings.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl From<QueueError> for ManagerError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::NotFound(id) => Self::NotFound(id),
            QueueError::Task(e) => Self::Task(e),
        }
    }
}

/// A download submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Source URL.
    pub url: String,
    /// Destination directory; defaults to the configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// Filename override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Segment count; defaults to the configured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<usize>,
    /// Per-task limit in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit: Option<u64>,
    /// Lowercase hex SHA-256 the file must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
}

impl DownloadRequest {
    /// Creates a request with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sets the destination directory.
    #[must_use]
    pub fn destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }

    /// Sets the filename.
    #[must_use]
    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    /// Sets the segment count.
    #[must_use]
    pub fn segments(mut self, count: usize) -> Self {
        self.segments = Some(count);
        self
    }

    /// Sets the per-task speed limit.
    #[must_use]
    pub fn speed_limit(mut self, bytes_per_second: u64) -> Self {
        self.speed_limit = Some(bytes_per_second);
        self
    }

    /// Sets the expected SHA-256.
    #[must_use]
    pub fn expected_sha256(mut self, hex: impl Into<String>) -> Self {
        self.expected_sha256 = Some(hex.into());
        self
    }
}

/// Counts by status plus byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ManagerStats {
    /// Registered tasks.
    pub total: usize,
    /// New or Queued.
    pub queued: usize,
    /// Connecting or Downloading.
    pub active: usize,
    /// Paused.
    pub paused: usize,
    /// Completed.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Canceled.
    pub canceled: usize,
    /// Bytes on disk across all tasks.
    pub downloaded_bytes: u64,
    /// Sum of known sizes.
    pub total_bytes: u64,
    /// Sum of current speeds.
    pub speed: f64,
}

/// Façade over the queue, throttler, settings and task store.
#[derive(Debug)]
pub struct DownloadManager {
    settings: RwLock<Settings>,
    queue: Arc<DownloadQueue>,
    global_throttle: Arc<Throttler>,
    reservations: Arc<PathReservations>,
    store: Option<TaskStore>,
    events: broadcast::Sender<TaskEvent>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

fn transfer_context(
    settings: &Settings,
    global_throttle: &Arc<Throttler>,
    reservations: &Arc<PathReservations>,
) -> Result<TransferContext, ManagerError> {
    Ok(TransferContext {
        client: HttpClient::from_settings(&settings.connection).map_err(ManagerError::Client)?,
        retry: RetryPolicy::from_settings(&settings.connection),
        global_throttle: Arc::clone(global_throttle),
        reservations: Arc::clone(reservations),
    })
}

impl DownloadManager {
    /// Creates a manager. Background work starts with [`start`](Self::start).
    ///
    /// The task store is enabled when `general.state_file` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for invalid settings or when the HTTP client
    /// cannot be built.
    pub fn new(settings: Settings) -> Result<Self, ManagerError> {
        let store = settings.general.state_file.clone().map(TaskStore::new);
        Self::with_store(settings, store)
    }

    /// Creates a manager with an explicit task store.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_store(settings: Settings, store: Option<TaskStore>) -> Result<Self, ManagerError> {
        settings.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let global_throttle = Arc::new(Throttler::new(
            settings.get_global_speed_limit(),
            settings.bandwidth.burst_size,
        ));
        let reservations = Arc::new(PathReservations::default());
        let ctx = transfer_context(&settings, &global_throttle, &reservations)?;
        let queue = Arc::new(DownloadQueue::new(
            settings.get_max_concurrent_downloads(),
            ctx,
            events.clone(),
        ));
        Ok(Self {
            settings: RwLock::new(settings),
            queue,
            global_throttle,
            reservations,
            store,
            events,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Starts the queue loop and, with a task store, the save-on-change listener.
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if !background.is_empty() {
            return;
        }
        background.push(self.queue.spawn());
        if self.store.is_some() {
            background.push(tokio::spawn(persist_on_change(
                Arc::downgrade(self),
                self.events.subscribe(),
                self.shutdown.clone(),
            )));
        }
        info!(
            max_concurrent = self.queue.max_concurrent(),
            persistent = self.store.is_some(),
            "download manager started"
        );
    }

    /// Reloads tasks from the store; returns how many were restored.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Persistence`] when the store cannot be read.
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let default_segments = self.settings().get_segment_count();
        let mut restored = 0;
        for record in store.load().await? {
            let url = match validate_url(&record.url) {
                Ok(url) => url,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "skipping stored task");
                    continue;
                }
            };
            if self.queue.get(record.id).is_some() {
                continue;
            }
            let progress = record.progress();
            if let Some(path) = &progress.final_path {
                self.reservations.insert(path.clone());
            }
            let task = DownloadTask::restore(
                record.id,
                url,
                record.destination_path.clone(),
                record.options(default_segments),
                progress,
                self.events.clone(),
            );
            self.queue.insert(Arc::new(task));
            restored += 1;
        }
        info!(restored, "restored tasks");
        Ok(restored)
    }

    // ==================== Submission ====================

    /// Validates and enqueues a download.
    ///
    /// Nothing is created when the URL or destination is rejected.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Url`] for malformed URLs and unsupported schemes
    /// - [`ManagerError::Destination`] when the directory is unusable
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn add_download(&self, request: DownloadRequest) -> Result<TaskId, ManagerError> {
        let url = validate_url(&request.url)?;
        let (destination, segments) = {
            let settings = self.settings();
            (
                request
                    .destination
                    .clone()
                    .unwrap_or_else(|| settings.get_download_directory().to_path_buf()),
                request
                    .segments
                    .unwrap_or(settings.get_segment_count())
                    .clamp(1, 32),
            )
        };
        ensure_writable_dir(&destination).await?;

        let id = self.queue.allocate_id();
        let task = DownloadTask::new(
            id,
            url,
            destination,
            TaskOptions {
                filename: request.filename.filter(|f| !f.trim().is_empty()),
                segments,
                speed_limit: request.speed_limit.filter(|l| *l > 0),
                expected_sha256: request.expected_sha256,
            },
            self.events.clone(),
        );
        self.queue.insert(Arc::new(task));
        self.queue.enqueue(id)?;
        info!(task_id = %id, segments, "download added");
        Ok(id)
    }

    // ==================== Task Control ====================

    /// Pauses a download. `Ok(false)` when already paused.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for unknown ids and invalid transitions.
    pub fn pause_download(&self, id: TaskId) -> Result<bool, ManagerError> {
        Ok(self.queue.pause(id)?)
    }

    /// Resumes a paused download. `Ok(false)` when already queued or running.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for unknown ids and invalid transitions.
    pub fn resume_download(&self, id: TaskId) -> Result<bool, ManagerError> {
        Ok(self.queue.resume(id)?)
    }

    /// Cancels a download. `Ok(false)` when already canceled.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for unknown ids and invalid transitions.
    pub fn cancel_download(&self, id: TaskId) -> Result<bool, ManagerError> {
        Ok(self.queue.cancel(id)?)
    }

    /// Re-queues a failed or canceled download.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for unknown ids and invalid transitions.
    pub fn restart_download(&self, id: TaskId) -> Result<bool, ManagerError> {
        Ok(self.queue.restart(id)?)
    }

    /// Removes a download, optionally deleting its partial or final file.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] for unknown ids, or
    /// [`ManagerError::Destination`] when the file cannot be deleted.
    pub async fn remove_download(&self, id: TaskId, delete_file: bool) -> Result<(), ManagerError> {
        let task = self.queue.remove(id)?;
        if delete_file && let Some(path) = task.final_path() {
            let part = crate::download::filename::part_path(&path);
            for file in [part, path] {
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => debug!(path = %file.display(), "deleted file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(ManagerError::Destination { path: file, source });
                    }
                }
            }
        }
        info!(task_id = %id, delete_file, "download removed");
        Ok(())
    }

    /// Pauses every pausable download.
    pub fn pause_all(&self) -> usize {
        self.queue.pause_all()
    }

    /// Resumes every paused download.
    pub fn resume_all(&self) -> usize {
        self.queue.resume_all()
    }

    /// Cancels every unfinished download.
    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    /// Changes a task's speed limit (`None` or 0 = unlimited).
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] for unknown ids.
    pub fn set_task_speed_limit(&self, id: TaskId, limit: Option<u64>) -> Result<(), ManagerError> {
        self.task(id)
            .ok_or(ManagerError::NotFound(id))?
            .set_speed_limit(limit);
        Ok(())
    }

    // ==================== Queries ====================

    /// Looks up a task.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<Arc<DownloadTask>> {
        self.queue.get(id)
    }

    /// Snapshots of every task in id order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.queue.tasks().iter().map(|t| t.snapshot()).collect()
    }

    /// Snapshots of tasks in `status`.
    #[must_use]
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<TaskSnapshot> {
        self.queue
            .tasks()
            .iter()
            .filter(|t| t.status() == status)
            .map(|t| t.snapshot())
            .collect()
    }

    /// Resolves once the task reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] for unknown ids.
    pub async fn wait_for_download(&self, id: TaskId) -> Result<TaskStatus, ManagerError> {
        let task = self.task(id).ok_or(ManagerError::NotFound(id))?;
        let mut rx = task.subscribe_status();
        let status = *rx
            .wait_for(TaskStatus::is_terminal)
            .await
            .map_err(|_| ManagerError::NotFound(id))?;
        Ok(status)
    }

    /// Receiver for task events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Counts and byte totals.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for snapshot in self.tasks() {
            stats.total += 1;
            match snapshot.status {
                TaskStatus::New | TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Connecting | TaskStatus::Downloading => stats.active += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Canceled => stats.canceled += 1,
            }
            stats.downloaded_bytes += snapshot.downloaded;
            stats.total_bytes += snapshot.total_size.unwrap_or(0);
            stats.speed += snapshot.speed;
        }
        stats
    }

    /// The queue, for components that need direct access.
    #[must_use]
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// The global throttler.
    #[must_use]
    pub fn global_throttle(&self) -> &Arc<Throttler> {
        &self.global_throttle
    }

    /// HTTP client built from the current connection settings.
    #[must_use]
    pub fn http_client(&self) -> HttpClient {
        self.queue.transfer_context().client.clone()
    }

    // ==================== Settings ====================

    /// Copy of the live settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the settings and applies them to running components:
    /// concurrency, global bandwidth, retry policy and HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError`] for invalid settings or when the HTTP client
    /// cannot be built; the previous settings stay in force.
    pub fn apply_settings(&self, settings: Settings) -> Result<(), ManagerError> {
        settings.validate()?;
        let previous = self.settings();
        if previous.connection != settings.connection {
            let ctx = transfer_context(&settings, &self.global_throttle, &self.reservations)?;
            self.queue.set_transfer_context(ctx);
        }
        self.queue
            .set_max_concurrent(settings.general.max_concurrent_downloads);
        self.global_throttle
            .set_max_bandwidth(settings.bandwidth.global_speed_limit);
        self.global_throttle
            .set_burst_size(settings.bandwidth.burst_size);
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
        debug!("settings applied");
        Ok(())
    }

    /// Sets one setting by dotted key and applies it.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] for unknown keys or invalid values.
    pub fn update_setting(&self, key: &str, value: &str) -> Result<(), ManagerError> {
        let mut settings = self.settings();
        settings.set(key, value)?;
        self.apply_settings(settings)
    }

    // ==================== Lifecycle ====================

    /// Writes every unfinished task to the store.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Persistence`] when the write fails.
    pub async fn persist(&self) -> Result<(), ManagerError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .save(|| {
                self.queue
                    .tasks()
                    .iter()
                    .map(|t| TaskRecord::from_task(t))
                    .collect()
            })
            .await?;
        Ok(())
    }

    /// Pauses transferring tasks, stops background work and saves the store.
    pub async fn shutdown(&self) {
        let mut paused = 0;
        for task in self.queue.tasks() {
            if task.status().is_active() && matches!(task.pause(), Ok(true)) {
                paused += 1;
            }
        }
        self.shutdown.cancel();
        self.queue.shutdown().await;
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to save tasks on shutdown");
        }
        info!(paused, "download manager stopped");
    }
}

async fn ensure_writable_dir(dir: &std::path::Path) -> Result<(), ManagerError> {
    let destination_error = |source| ManagerError::Destination {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(destination_error)?;
    let metadata = tokio::fs::metadata(dir).await.map_err(destination_error)?;
    if !metadata.is_dir() {
        return Err(destination_error(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            "not a directory",
        )));
    }
    if metadata.permissions().readonly() {
        return Err(destination_error(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "directory is read-only",
        )));
    }
    Ok(())
}

/// Saves the store whenever a task is added, removed or changes status.
async fn persist_on_change(
    manager: Weak<DownloadManager>,
    mut events: broadcast::Receiver<TaskEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TaskEvent::Progress { .. }) => continue,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Err(e) = manager.persist().await {
            warn!(error = %e, "failed to save tasks");
        }
    }
}
