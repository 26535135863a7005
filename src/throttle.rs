//! Token-bucket bandwidth limiting for segment workers.
//!
//! # Overview
//!
//! A [`Throttler`] holds up to `max_tokens` bytes of allowance. Tokens accrue at
//! `bytes_per_second` and are refilled lazily on every call; there is no
//! background task. Segment workers call [`Throttler::request`] before writing a
//! chunk, so the aggregate throughput of every worker sharing one throttler is
//! capped at the configured rate plus one burst.
//!
//! A rate of `0` disables limiting. A burst of `0` makes the bucket hold exactly
//! one second of the current rate, so lowering the rate also shrinks the burst.
//!
//! # Example
//!
//! ```no_run
//! use dlm_core::throttle::Throttler;
//!
//! # async fn example() {
//! let throttler = Throttler::new(1024, 1024);
//! throttler.request(512).await;
//! throttler.set_max_bandwidth(0); // unlimited from now on
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

/// Shared token-bucket limiter.
///
/// One mutex guards the bucket and is never held across an await point.
/// Waiters park on a [`Notify`] and are all woken when the rate, burst or
/// enabled flag changes so they can re-evaluate against the new limit.
#[derive(Debug)]
pub struct Throttler {
    bucket: Mutex<Bucket>,
    changed: Notify,
}

#[derive(Debug)]
struct Bucket {
    bytes_per_second: u64,
    burst_size: u64,
    enabled: bool,
    tokens: f64,
    last_fill: Instant,
}

impl Bucket {
    fn is_limited(&self) -> bool {
        self.enabled && self.bytes_per_second > 0
    }

    #[allow(clippy::cast_precision_loss)]
    fn max_tokens(&self) -> f64 {
        if self.burst_size == 0 {
            self.bytes_per_second as f64
        } else {
            self.burst_size as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn fill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_fill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_second as f64).min(self.max_tokens());
        self.last_fill = now;
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Throttler {
    /// Creates a throttler limited to `bytes_per_second` with the given burst.
    ///
    /// The bucket starts full.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(bytes_per_second: u64, burst_size: u64) -> Self {
        let mut bucket = Bucket {
            bytes_per_second,
            burst_size,
            enabled: true,
            tokens: 0.0,
            last_fill: Instant::now(),
        };
        bucket.tokens = bucket.max_tokens();
        Self {
            bucket: Mutex::new(bucket),
            changed: Notify::new(),
        }
    }

    /// Creates a throttler that never delays.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the configured rate in bytes per second (0 = unlimited).
    #[must_use]
    pub fn max_bandwidth(&self) -> u64 {
        self.lock().bytes_per_second
    }

    /// Returns the configured burst size (0 = one second of bandwidth).
    #[must_use]
    pub fn burst_size(&self) -> u64 {
        self.lock().burst_size
    }

    /// Returns whether requests are currently being delayed.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        self.lock().is_limited()
    }

    /// Changes the rate and wakes every waiter.
    #[instrument(skip(self))]
    pub fn set_max_bandwidth(&self, bytes_per_second: u64) {
        {
            let mut bucket = self.lock();
            bucket.fill(Instant::now());
            bucket.bytes_per_second = bytes_per_second;
            bucket.tokens = bucket.tokens.min(bucket.max_tokens());
        }
        debug!("bandwidth limit changed");
        self.changed.notify_waiters();
    }

    /// Changes the burst size and wakes every waiter.
    #[instrument(skip(self))]
    pub fn set_burst_size(&self, burst_size: u64) {
        {
            let mut bucket = self.lock();
            bucket.fill(Instant::now());
            bucket.burst_size = burst_size;
            bucket.tokens = bucket.tokens.min(bucket.max_tokens());
        }
        self.changed.notify_waiters();
    }

    /// Enables or disables limiting and wakes every waiter.
    #[instrument(skip(self))]
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut bucket = self.lock();
            bucket.fill(Instant::now());
            bucket.enabled = enabled;
        }
        self.changed.notify_waiters();
    }

    /// Waits until `bytes` tokens are available, then debits them.
    ///
    /// Returns immediately when limiting is disabled. Requests larger than the
    /// bucket are served in bucket-sized chunks.
    pub async fn request(&self, bytes: u64) {
        self.acquire(bytes, None).await;
    }

    /// Like [`request`](Self::request) but gives up once `timeout` elapses.
    ///
    /// Returns `true` after debiting all `bytes`. On timeout returns `false`
    /// and refunds any chunk already debited by this call.
    pub async fn request_with_timeout(&self, bytes: u64, timeout: Duration) -> bool {
        self.acquire(bytes, Some(Instant::now() + timeout)).await
    }

    #[allow(clippy::cast_precision_loss)]
    async fn acquire(&self, bytes: u64, deadline: Option<Instant>) -> bool {
        let mut remaining = bytes as f64;
        let mut debited = 0.0_f64;

        while remaining > 0.0 {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut bucket = self.lock();
                if !bucket.is_limited() {
                    return true;
                }
                let now = Instant::now();
                bucket.fill(now);

                let chunk = remaining.min(bucket.max_tokens());
                if bucket.tokens >= chunk {
                    bucket.tokens -= chunk;
                    remaining -= chunk;
                    debited += chunk;
                    continue;
                }

                if deadline.is_some_and(|d| now >= d) {
                    bucket.tokens = (bucket.tokens + debited).min(bucket.max_tokens());
                    debug!(
                        requested = bytes,
                        refunded = debited,
                        "throttle request timed out"
                    );
                    return false;
                }

                let deficit = chunk - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.bytes_per_second as f64)
            };

            let wake_at = match deadline {
                Some(d) => (Instant::now() + wait).min(d),
                None => Instant::now() + wait,
            };
            trace!(wait_ms = wait.as_millis(), "waiting for tokens");
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    // ==================== Configuration Tests ====================

    #[test]
    fn test_unlimited_is_not_limited() {
        let throttler = Throttler::unlimited();
        assert!(!throttler.is_limited());
        assert_eq!(throttler.max_bandwidth(), 0);
    }

    #[test]
    fn test_zero_burst_defaults_to_one_second_of_bandwidth() {
        let throttler = Throttler::new(4096, 0);
        let bucket = throttler.lock();
        assert!((bucket.max_tokens() - 4096.0).abs() < f64::EPSILON);
        assert!((bucket.tokens - 4096.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lowering_bandwidth_shrinks_default_burst() {
        let throttler = Throttler::new(4096, 0);
        throttler.set_max_bandwidth(1024);
        let bucket = throttler.lock();
        assert!((bucket.max_tokens() - 1024.0).abs() < f64::EPSILON);
        assert!(bucket.tokens <= 1024.0);
    }

    // ==================== Request Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_request_unlimited_returns_immediately() {
        let throttler = Throttler::unlimited();
        let start = Instant::now();
        throttler.request(10 * 1024 * 1024).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_within_burst_is_immediate() {
        let throttler = Throttler::new(1024, 1024);
        let start = Instant::now();
        throttler.request(1024).await;
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_double_burst_blocks_about_one_second() {
        let throttler = Throttler::new(1024, 1024);
        let start = Instant::now();
        throttler.request(2048).await;
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(990) && elapsed <= Duration::from_millis(1100),
            "expected ~1s, got {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_with_timeout_expires_and_refunds() {
        let throttler = Throttler::new(100, 100);
        // First chunk (100) is debited from the full bucket, the second (50)
        // cannot accrue within 200ms.
        let ok = throttler
            .request_with_timeout(150, Duration::from_millis(200))
            .await;
        assert!(!ok);

        // The first chunk was refunded, so a full bucket is available again.
        let start = Instant::now();
        throttler.request(100).await;
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_with_timeout_succeeds_when_tokens_accrue() {
        let throttler = Throttler::new(1000, 1000);
        throttler.request(1000).await;
        let ok = throttler
            .request_with_timeout(500, Duration::from_secs(2))
            .await;
        assert!(ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_enabled_false_wakes_waiter() {
        let throttler = Arc::new(Throttler::new(10, 10));
        throttler.request(10).await;

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                let start = Instant::now();
                throttler.request(10_000).await;
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        throttler.set_enabled(false);

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_bandwidth_shortens_wait() {
        let throttler = Arc::new(Throttler::new(10, 10));
        throttler.request(10).await;

        let waiter = {
            let throttler = Arc::clone(&throttler);
            tokio::spawn(async move {
                let start = Instant::now();
                throttler.request(10).await;
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttler.set_max_bandwidth(10_000);

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_millis(100), "waited {waited:?}");
    }

    // ==================== Conservation Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_respect_rate_plus_burst() {
        const RATE: u64 = 4096;
        const BURST: u64 = 1024;
        let throttler = Arc::new(Throttler::new(RATE, BURST));
        let released = Arc::new(AtomicU64::new(0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let throttler = Arc::clone(&throttler);
            let released = Arc::clone(&released);
            handles.push(tokio::spawn(async move {
                for _ in 0..16 {
                    throttler.request(512).await;
                    released.fetch_add(512, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total = released.load(Ordering::SeqCst);
        let window = start.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let bound = RATE as f64 * window + BURST as f64;
        #[allow(clippy::cast_precision_loss)]
        let total_f = total as f64;
        assert!(total_f <= bound + 1.0, "released {total} in {window}s");
    }
}
