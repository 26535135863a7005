//! Batch downloads.
//!
//! A [`BatchDownloader`] collects [`BatchItem`]s from any [`BatchSource`] and
//! feeds them to the [`DownloadManager`] under its own concurrency cap, which
//! is independent of the queue's limit. Up to `max_concurrent` items are
//! active at once; each is awaited in its own tokio task and the dispatcher
//! wakes as soon as one finishes.
//!
//! Invalid entries are skipped with a warning when items are added, so a
//! running batch only ever contains valid URLs.

mod item;
mod source;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::BatchSettings;
use crate::download::constants::EVENT_CHANNEL_CAPACITY;
use crate::download::{DownloadError, TaskId, TaskStatus};
use crate::events::{BatchEvent, BatchProgress, BatchSummary};
use crate::manager::{DownloadManager, DownloadRequest};
use crate::parser::{ParseError, SkippedInput, validate_url};

pub use item::{BatchItem, BatchItemStatus};
pub use source::{
    BatchSource, LoadedSource, MAX_PATTERN_EXPANSION, expand_pattern, parse_csv,
    parse_html_links, parse_list, parse_sitemap, parse_text_urls,
};

/// Errors from building or controlling a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A URL or pattern was rejected.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A source file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A remote list could not be fetched.
    #[error("failed to fetch URL list: {0}")]
    Fetch(#[source] DownloadError),

    /// The operation is not allowed while the batch runs.
    #[error("the batch is running")]
    AlreadyRunning,

    /// Items are still downloading from an earlier run.
    #[error("{0} batch items are still downloading")]
    ItemsActive(usize),
}

/// Result of adding a source to a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddSummary {
    /// Items appended.
    pub added: usize,
    /// Entries rejected.
    pub skipped: Vec<SkippedInput>,
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct Shared {
    manager: Arc<DownloadManager>,
    items: Mutex<Vec<BatchItem>>,
    // Bumped under the items lock whenever the list is cleared, so a watcher
    // from before the clear never writes into a new item at the same index.
    generation: AtomicU64,
    running: watch::Sender<bool>,
    max_concurrent: AtomicUsize,
    max_total: AtomicUsize,
    paused: watch::Sender<bool>,
    wake: Notify,
    events: broadcast::Sender<BatchEvent>,
}

impl Shared {
    fn items(&self) -> MutexGuard<'_, Vec<BatchItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }

    fn progress(&self) -> BatchProgress {
        let items = self.items();
        let success = items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Completed)
            .count();
        let failure = items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Failed)
            .count();
        let processed = success + failure;
        #[allow(clippy::cast_precision_loss)]
        let overall_progress = if items.is_empty() {
            0.0
        } else {
            processed as f64 / items.len() as f64
        };
        BatchProgress {
            processed,
            total: items.len(),
            overall_progress,
            success,
            failure,
        }
    }

    fn summary(&self) -> BatchSummary {
        let items = self.items();
        let failed_urls: Vec<String> = items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Failed)
            .map(|i| i.url.clone())
            .collect();
        BatchSummary {
            success: items
                .iter()
                .filter(|i| i.status == BatchItemStatus::Completed)
                .count(),
            failure: failed_urls.len(),
            failed_urls,
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn finish_item(&self, generation: u64, index: usize, success: bool, error: Option<String>) {
        let url = {
            let mut items = self.items();
            if self.generation() != generation {
                debug!(index, "ignoring result for a cleared batch item");
                return;
            }
            let Some(item) = items.get_mut(index) else {
                return;
            };
            item.status = if success {
                BatchItemStatus::Completed
            } else {
                BatchItemStatus::Failed
            };
            item.error.clone_from(&error);
            item.url.clone()
        };
        if success {
            debug!(index, url = %url, "batch item completed");
        } else {
            warn!(index, url = %url, error = ?error, "batch item failed");
        }
        self.emit(BatchEvent::ItemFinished {
            index,
            url,
            success,
            error,
        });
        self.emit(BatchEvent::Progress(self.progress()));
        self.wake.notify_one();
    }
}

/// Dispatches a list of URLs to the manager.
#[derive(Debug)]
pub struct BatchDownloader {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveRun>>,
}

impl BatchDownloader {
    /// Creates a batch with limits from `settings`.
    #[must_use]
    pub fn new(manager: Arc<DownloadManager>, settings: &BatchSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                manager,
                items: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                running: watch::Sender::new(false),
                max_concurrent: AtomicUsize::new(settings.max_concurrent.max(1)),
                max_total: AtomicUsize::new(settings.max_total_downloads),
                paused: watch::Sender::new(false),
                wake: Notify::new(),
                events,
            }),
            active: Mutex::new(None),
        }
    }

    // ==================== Items ====================

    /// Appends one URL.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Parse`] when the URL is invalid; nothing is added.
    pub fn add_url(&self, url: &str) -> Result<usize, BatchError> {
        let url = validate_url(url)?;
        Ok(self.add_item(BatchItem::new(url.as_str())))
    }

    /// Appends an item, returning its index.
    pub fn add_item(&self, item: BatchItem) -> usize {
        let mut items = self.shared.items();
        items.push(item);
        self.shared.wake.notify_one();
        items.len() - 1
    }

    /// Appends every valid URL; invalid ones are skipped with a warning.
    pub fn add_urls<S: AsRef<str>>(&self, urls: &[S]) -> AddSummary {
        self.append(source::parse_list(urls).into())
    }

    /// Appends the contents of a source.
    ///
    /// # Errors
    ///
    /// See [`BatchSource::load`].
    #[instrument(skip(self, source), fields(kind = source.kind()))]
    pub async fn add_from_source(&self, source: &BatchSource) -> Result<AddSummary, BatchError> {
        let client = self.shared.manager.http_client();
        let loaded = source.load(&client).await?;
        Ok(self.append(loaded))
    }

    /// Appends the expansion of a URL pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Parse`] when the pattern is malformed or too large.
    pub fn add_pattern(&self, pattern: &str) -> Result<AddSummary, BatchError> {
        let expanded = expand_pattern(pattern)?;
        Ok(self.add_urls(&expanded))
    }

    fn append(&self, loaded: LoadedSource) -> AddSummary {
        let added = loaded.items.len();
        self.shared.items().extend(loaded.items);
        self.shared.wake.notify_one();
        info!(added, skipped = loaded.skipped.len(), "added batch items");
        AddSummary {
            added,
            skipped: loaded.skipped,
        }
    }

    /// Snapshot of every item.
    #[must_use]
    pub fn items(&self) -> Vec<BatchItem> {
        self.shared.items().clone()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.items().len()
    }

    /// True when no items were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.items().is_empty()
    }

    /// Removes every item.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::AlreadyRunning`] while the batch runs and
    /// [`BatchError::ItemsActive`] while items of a stopped run still download.
    pub fn clear(&self) -> Result<(), BatchError> {
        if self.is_running() {
            return Err(BatchError::AlreadyRunning);
        }
        let mut items = self.shared.items();
        let active = items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Active)
            .count();
        if active > 0 {
            return Err(BatchError::ItemsActive(active));
        }
        items.clear();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Current progress counters.
    #[must_use]
    pub fn progress(&self) -> BatchProgress {
        self.shared.progress()
    }

    // ==================== Limits ====================

    /// Items active at once.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }

    /// Changes the active-item limit; applies to the next dispatch.
    pub fn set_max_concurrent(&self, limit: usize) {
        self.shared
            .max_concurrent
            .store(limit.max(1), Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Caps how many items one run dispatches (0 = no cap).
    pub fn set_max_total_downloads(&self, limit: usize) {
        self.shared.max_total.store(limit, Ordering::SeqCst);
    }

    // ==================== Run control ====================

    /// Starts dispatching pending items.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::AlreadyRunning`] if a run is in progress.
    pub fn start(&self) -> Result<(), BatchError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.running.send_replace(true) {
            return Err(BatchError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            dispatch(&shared, token).await;
            shared.running.send_replace(false);
        });
        *active = Some(ActiveRun { cancel, handle });
        info!(items = self.len(), max_concurrent = self.max_concurrent(), "batch started");
        Ok(())
    }

    /// Stops dispatching. Active items keep downloading; pending ones stay pending.
    pub async fn stop(&self) {
        let run = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(run) = run {
            run.cancel.cancel();
            let _ = run.handle.await;
            info!("batch stopped");
        }
    }

    /// Holds back new dispatches. Returns false if already paused.
    pub fn pause(&self) -> bool {
        !self.shared.paused.send_replace(true)
    }

    /// Lets dispatching continue. Returns false if not paused.
    pub fn resume(&self) -> bool {
        self.shared.paused.send_replace(false)
    }

    /// Whether dispatch is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    /// Waits for the current run to end and returns the tally.
    ///
    /// The run stays registered while waiting, so [`stop`](Self::stop) and
    /// [`is_running`](Self::is_running) keep working from other tasks.
    pub async fn wait(&self) -> BatchSummary {
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
        self.shared.summary()
    }

    /// Receiver for batch events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.shared.events.subscribe()
    }
}

enum Step {
    Dispatch(usize, BatchItem),
    Wait,
    Finished,
}

async fn dispatch(shared: &Arc<Shared>, cancel: CancellationToken) {
    let mut paused = shared.paused.subscribe();
    let mut dispatched = 0usize;

    loop {
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let step = {
            let max_total = shared.max_total.load(Ordering::SeqCst);
            let cap_reached = max_total > 0 && dispatched >= max_total;
            let mut items = shared.items();
            let active = items
                .iter()
                .filter(|i| i.status == BatchItemStatus::Active)
                .count();
            let next = items
                .iter()
                .position(|i| i.status == BatchItemStatus::Pending);
            let can_start = !*paused.borrow_and_update()
                && !cap_reached
                && active < shared.max_concurrent.load(Ordering::SeqCst);

            match next {
                Some(index) if can_start => {
                    items[index].status = BatchItemStatus::Active;
                    Step::Dispatch(index, items[index].clone())
                }
                _ if active == 0 && (next.is_none() || cap_reached) => Step::Finished,
                _ => Step::Wait,
            }
        };

        match step {
            Step::Finished => break,
            Step::Wait => {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = notified => {}
                    _ = paused.changed() => {}
                }
            }
            Step::Dispatch(index, item) => {
                dispatched += 1;
                submit(shared, index, item).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }

    let summary = shared.summary();
    info!(
        success = summary.success,
        failure = summary.failure,
        "batch finished"
    );
    shared.emit(BatchEvent::Finished(summary));
}

async fn submit(shared: &Arc<Shared>, index: usize, item: BatchItem) {
    let generation = shared.generation();
    let mut request = DownloadRequest::new(item.url.clone());
    if let Some(dir) = item.destination {
        request = request.destination(dir);
    }
    if let Some(name) = item.filename {
        request = request.filename(name);
    }

    match shared.manager.add_download(request).await {
        Ok(id) => {
            if let Some(entry) = shared.items().get_mut(index) {
                entry.task_id = Some(id);
            }
            shared.emit(BatchEvent::ItemStarted {
                index,
                url: item.url,
                task_id: id,
            });
            tokio::spawn(watch_item(Arc::clone(shared), generation, index, id));
        }
        Err(e) => shared.finish_item(generation, index, false, Some(e.to_string())),
    }
}

async fn watch_item(shared: Arc<Shared>, generation: u64, index: usize, id: TaskId) {
    match shared.manager.wait_for_download(id).await {
        Ok(TaskStatus::Completed) => shared.finish_item(generation, index, true, None),
        Ok(status) => {
            let error = shared
                .manager
                .task(id)
                .and_then(|t| t.error())
                .unwrap_or_else(|| format!("download {status}"));
            shared.finish_item(generation, index, false, Some(error));
        }
        Err(e) => shared.finish_item(generation, index, false, Some(e.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn batch() -> BatchDownloader {
        let manager = Arc::new(DownloadManager::with_store(Settings::default(), None).unwrap());
        BatchDownloader::new(manager, &BatchSettings::default())
    }

    #[tokio::test]
    async fn test_add_url_rejects_invalid() {
        let b = batch();
        assert!(b.add_url("nope").is_err());
        assert_eq!(b.add_url("https://example.com/a").unwrap(), 0);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_add_urls_skips_invalid() {
        let b = batch();
        let summary = b.add_urls(&[
            "https://e.com/1",
            "bad",
            "https://e.com/2",
            "ftp://e.com/3",
            "https://e.com/4",
        ]);
        assert_eq!(summary.added, 3);
        assert_eq!(summary.skipped.len(), 2);
        assert!(b.items().iter().all(|i| i.status == BatchItemStatus::Pending));
    }

    #[tokio::test]
    async fn test_add_pattern() {
        let b = batch();
        let summary = b.add_pattern("https://e.com/f[1-5].bin").unwrap();
        assert_eq!(summary.added, 5);
        assert!(b.add_pattern("https://e.com/[9-1]").is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_finishes_immediately() {
        let b = batch();
        let mut events = b.subscribe();
        b.start().unwrap();
        let summary = b.wait().await;
        assert_eq!(summary, BatchSummary::default());
        assert!(matches!(events.recv().await.unwrap(), BatchEvent::Finished(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_flags() {
        let b = batch();
        assert!(b.pause());
        assert!(!b.pause());
        assert!(b.is_paused());
        assert!(b.resume());
        assert!(!b.resume());
    }

    #[tokio::test]
    async fn test_progress_counts() {
        let b = batch();
        b.add_urls(&["https://e.com/1", "https://e.com/2"]);
        b.shared.finish_item(b.shared.generation(), 0, false, Some("boom".into()));
        let progress = b.progress();
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.failure, 1);
        assert!((progress.overall_progress - 0.5).abs() < f64::EPSILON);
        assert_eq!(b.shared.summary().failed_urls, vec!["https://e.com/1"]);
    }

    fn batch_in(dir: &tempfile::TempDir) -> BatchDownloader {
        let mut settings = Settings::default();
        settings.general.download_directory = dir.path().to_path_buf();
        let manager = Arc::new(DownloadManager::with_store(settings, None).unwrap());
        BatchDownloader::new(manager, &BatchSettings::default())
    }

    async fn wait_for_item<F>(b: &BatchDownloader, index: usize, done: F) -> BatchItem
    where
        F: Fn(&BatchItem) -> bool,
    {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(item) = b.items().get(index).filter(|item| done(*item)) {
                    return item.clone();
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_stopped_run_result_never_lands_on_new_item() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = batch_in(&dir);
        b.add_url("https://example.com/old.bin").unwrap();
        b.start().unwrap();
        // The manager loop is not running, so the task stays queued.
        let old = wait_for_item(&b, 0, |i| i.task_id.is_some()).await;
        b.stop().await;
        assert!(!b.is_running());

        assert!(matches!(b.clear(), Err(BatchError::ItemsActive(1))));
        b.shared.manager.cancel_download(old.task_id.unwrap()).unwrap();
        let old = wait_for_item(&b, 0, |i| i.status.is_finished()).await;
        assert_eq!(old.status, BatchItemStatus::Failed);

        b.clear().unwrap();
        b.add_url("https://example.com/new.bin").unwrap();
        // A result reported with the pre-clear generation is dropped.
        b.shared.finish_item(b.shared.generation() - 1, 0, false, Some("stale".into()));
        let new = &b.items()[0];
        assert_eq!(new.url, "https://example.com/new.bin");
        assert_eq!(new.status, BatchItemStatus::Pending);
        assert_eq!(new.error, None);
    }

    #[tokio::test]
    async fn test_wait_keeps_run_registered() {
        let b = batch();
        b.add_url("https://e.com/1").unwrap();
        b.pause();
        b.start().unwrap();
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), b.wait()).await;
        assert!(waited.is_err());
        assert!(b.is_running());
        assert!(matches!(b.clear(), Err(BatchError::AlreadyRunning)));
        assert!(matches!(b.start(), Err(BatchError::AlreadyRunning)));
        b.stop().await;
        assert!(!b.is_running());
    }

    #[tokio::test]
    async fn test_clear_refused_while_running() {
        let b = batch();
        b.add_url("https://e.com/1").unwrap();
        b.pause();
        b.start().unwrap();
        assert!(matches!(b.clear(), Err(BatchError::AlreadyRunning)));
        b.stop().await;
        b.clear().unwrap();
        assert!(b.is_empty());
    }
}
