//! Segmented HTTP downloads.
//!
//! A [`DownloadTask`] is one URL-to-file transfer. When admitted by the queue,
//! it probes the server, splits the file into byte-range [`Segment`]s and runs
//! one worker per segment. Workers write into a preallocated `<name>.part`
//! file, take bandwidth tokens before every write, and retry transient
//! failures per [`RetryPolicy`]. The finished file is renamed into place and
//! optionally checked against a SHA-256 digest.
//!
//! # Example
//!
//! ```no_run
//! use dlm_core::download::HttpClient;
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let probe = client.probe(&Url::parse("https://example.com/big.iso")?).await?;
//! println!("{:?} bytes, resumable: {}", probe.total_size, probe.resumable);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
pub(crate) mod filename;
mod retry;
mod segment;
mod task;
pub(crate) mod transfer;

pub use client::{FetchedPage, HttpClient, ProbeResult, RangeResponse};
pub use error::DownloadError;
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
pub use segment::{Segment, SegmentStatus, plan_segments};
pub use task::{DownloadTask, TaskError, TaskId, TaskOptions, TaskSnapshot, TaskStatus};
pub(crate) use task::RestoredProgress;

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
