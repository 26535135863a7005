//! dlm core library
//!
//! Segmented, resumable HTTP downloads driven by a concurrency-limited queue,
//! with batch, crawl and time-based scheduling front-ends that all submit work
//! through a single [`DownloadManager`].
//!
//! # Architecture
//!
//! - [`throttle`] - Token-bucket bandwidth limiter shared by segment workers
//! - [`download`] - Tasks, byte-range segments, HTTP client and transfer workers
//! - [`queue`] - Task registry and the admission/tick loop
//! - [`manager`] - The façade every front-end talks to
//! - [`persistence`] - JSON task records reloaded on startup
//! - [`batch`] - Bulk URL sources and the batch dispatcher
//! - [`crawler`] - Breadth-first website crawler with robots.txt support
//! - [`scheduler`] - Wall-clock one-shot and recurring actions
//! - [`config`] - Typed, validated settings loaded from TOML
//! - [`events`] - Broadcast event types consumed by the CLI

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod config;
pub mod crawler;
pub mod download;
pub mod events;
pub mod manager;
pub mod parser;
pub mod persistence;
pub mod queue;
pub mod scheduler;
pub mod throttle;
mod user_agent;

// Re-export commonly used types
pub use batch::{BatchDownloader, BatchError, BatchItem, BatchItemStatus, BatchSource};
pub use config::{Backoff, ConfigError, Settings};
pub use crawler::{CrawlConfig, CrawlError, CrawlState, DomainScope, WebsiteCrawler};
pub use download::{
    DownloadError, DownloadTask, HttpClient, RetryPolicy, Segment, SegmentStatus, TaskId,
    TaskSnapshot, TaskStatus,
};
pub use events::{BatchEvent, CrawlEvent, TaskEvent};
pub use manager::{DownloadManager, DownloadRequest, ManagerError, ManagerStats};
pub use parser::{ParseError, ParseResult, parse_input};
pub use persistence::{PersistenceError, TaskRecord, TaskStore};
pub use queue::{DownloadQueue, QueueError};
pub use scheduler::{DownloadScheduler, Recurrence, ScheduleAction, ScheduleError, ScheduleId};
pub use throttle::Throttler;
