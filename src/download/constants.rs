//! Constants for the download module.

use std::time::Duration;

/// Default HTTP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout.
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Interval of the queue's admission and speed-sampling tick.
pub const QUEUE_TICK: Duration = Duration::from_millis(100);

/// Capacity of the broadcast channels used for task, batch and crawl events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
