//! Shared runtime state of the interactive shell.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dlm_core::{
    BatchDownloader, BatchEvent, CrawlEvent, DownloadManager, DownloadScheduler, Settings,
    WebsiteCrawler,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app::progress::{ProgressUi, spawn_progress_ui};

/// Holds every front-end built on one manager so shell commands can reach
/// them through `ctx.manager`, `ctx.batch`, and so on.
pub(crate) struct AppContext {
    pub(crate) manager: Arc<DownloadManager>,
    pub(crate) batch: BatchDownloader,
    pub(crate) crawler: WebsiteCrawler,
    pub(crate) scheduler: Arc<DownloadScheduler>,
    pub(crate) config_path: Option<PathBuf>,
    progress: Option<ProgressUi>,
    listeners: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Builds the manager, restores saved tasks and starts the background loops.
    pub(crate) async fn build(
        settings: Settings,
        config_path: Option<PathBuf>,
        show_progress: bool,
    ) -> Result<Self> {
        let batch_settings = settings.batch.clone();
        let manager =
            Arc::new(DownloadManager::new(settings).context("failed to create download manager")?);
        let restored = manager
            .restore()
            .await
            .context("failed to restore saved downloads")?;
        manager.start();

        let batch = BatchDownloader::new(Arc::clone(&manager), &batch_settings);
        let crawler = WebsiteCrawler::with_manager(Arc::clone(&manager));
        let scheduler = Arc::new(DownloadScheduler::new(Arc::clone(&manager)));
        scheduler.start();

        let listeners = vec![
            tokio::spawn(log_batch_events(batch.subscribe())),
            tokio::spawn(log_crawl_events(crawler.subscribe())),
        ];
        let progress = spawn_progress_ui(show_progress, &manager);
        info!(restored, "dlm ready");

        Ok(Self {
            manager,
            batch,
            crawler,
            scheduler,
            config_path,
            progress,
            listeners,
        })
    }

    pub(crate) fn progress_enabled(&self) -> bool {
        self.progress.is_some()
    }

    /// Turns the progress display on or off.
    pub(crate) async fn set_progress(&mut self, enabled: bool) {
        match (enabled, self.progress.take()) {
            (true, None) => self.progress = spawn_progress_ui(true, &self.manager),
            (true, Some(ui)) => self.progress = Some(ui),
            (false, Some(ui)) => ui.stop().await,
            (false, None) => {}
        }
    }

    /// Stops every front-end, then the manager, which saves unfinished tasks.
    pub(crate) async fn shutdown(mut self) {
        self.crawler.stop().await;
        self.batch.stop().await;
        self.scheduler.stop().await;
        if let Some(ui) = self.progress.take() {
            ui.stop().await;
        }
        self.manager.shutdown().await;
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }
}

async fn log_batch_events(mut events: tokio::sync::broadcast::Receiver<BatchEvent>) {
    loop {
        match events.recv().await {
            Ok(BatchEvent::ItemFinished {
                url,
                success: false,
                error,
                ..
            }) => warn!(url = %url, error = error.as_deref().unwrap_or("unknown"), "batch item failed"),
            Ok(BatchEvent::Finished(summary)) => info!(
                success = summary.success,
                failure = summary.failure,
                "batch finished"
            ),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_crawl_events(mut events: tokio::sync::broadcast::Receiver<CrawlEvent>) {
    loop {
        match events.recv().await {
            Ok(CrawlEvent::FileFound { url, .. }) => info!(url = %url, "crawler found file"),
            Ok(CrawlEvent::Error { url, message }) => warn!(url = %url, error = %message, "crawl error"),
            Ok(CrawlEvent::Finished(progress)) => info!(
                pages = progress.pages_visited,
                resources = progress.resources_found,
                queued = progress.downloads_queued,
                "crawl finished"
            ),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}
