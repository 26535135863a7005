//! Events broadcast to observers.
//!
//! Every producer (queue, batch dispatcher, crawler) owns a
//! `tokio::sync::broadcast::Sender` and hands out receivers through its
//! `subscribe()` method. A lagging receiver loses old events rather than
//! slowing the producer.

use serde::Serialize;

use crate::download::{TaskId, TaskStatus};

/// Task lifecycle and progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task was created.
    Added {
        /// New task.
        id: TaskId,
        /// Source URL.
        url: String,
    },
    /// A task changed status.
    StatusChanged {
        /// Affected task.
        id: TaskId,
        /// Status after the change.
        status: TaskStatus,
    },
    /// Sampled progress of a transferring task.
    Progress {
        /// Affected task.
        id: TaskId,
        /// Bytes on disk.
        downloaded: u64,
        /// Total size, if known.
        total: Option<u64>,
        /// Current speed in bytes per second.
        speed: f64,
    },
    /// A task was removed from the registry.
    Removed {
        /// Removed task.
        id: TaskId,
    },
}

/// Aggregate progress of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatchProgress {
    /// Items finished (completed or failed).
    pub processed: usize,
    /// Items in the batch.
    pub total: usize,
    /// `processed / total` in `[0, 1]`.
    pub overall_progress: f64,
    /// Items completed.
    pub success: usize,
    /// Items failed.
    pub failure: usize,
}

/// Final tally of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Items completed.
    pub success: usize,
    /// Items failed.
    pub failure: usize,
    /// URLs of the failed items.
    pub failed_urls: Vec<String>,
}

/// Batch dispatcher notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// An item was handed to the manager.
    ItemStarted {
        /// Item position in the batch.
        index: usize,
        /// Item URL.
        url: String,
        /// Task created for it.
        task_id: TaskId,
    },
    /// An item reached a final state.
    ItemFinished {
        /// Item position in the batch.
        index: usize,
        /// Item URL.
        url: String,
        /// Whether the download completed.
        success: bool,
        /// Failure reason.
        error: Option<String>,
    },
    /// Progress after an item finished.
    Progress(BatchProgress),
    /// The run ended.
    Finished(BatchSummary),
}

/// Crawl progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlProgress {
    /// Pages fetched so far.
    pub pages_visited: usize,
    /// URLs ever queued.
    pub total_urls: usize,
    /// Downloadable resources found.
    pub resources_found: usize,
    /// Resources submitted to the manager.
    pub downloads_queued: usize,
}

/// Crawler notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlEvent {
    /// A page was fetched.
    PageVisited {
        /// Page URL.
        url: String,
        /// Link hops from the seed.
        depth: usize,
    },
    /// A downloadable resource was found.
    FileFound {
        /// Resource URL.
        url: String,
        /// Depth of the page linking to it plus one.
        depth: usize,
    },
    /// Counters after a page was processed.
    Progress(CrawlProgress),
    /// A page or robots.txt could not be processed; the crawl continues.
    Error {
        /// URL involved.
        url: String,
        /// What went wrong.
        message: String,
    },
    /// The crawl ended.
    Finished(CrawlProgress),
}
