//! Per-domain request spacing for the crawler.
//!
//! Requests to different domains never wait on each other; only consecutive
//! requests to the *same* domain are spaced by the configured delay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};
use url::Url;

/// Spaces requests per domain.
#[derive(Debug)]
pub struct PolitenessDelay {
    delay: Duration,
    // Arc lets the DashMap shard lock drop before awaiting the inner Mutex.
    domains: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl PolitenessDelay {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            domains: DashMap::new(),
        }
    }

    /// Waits until a request to `url`'s domain is allowed, then records it.
    ///
    /// The first request to a domain proceeds immediately.
    #[instrument(skip(self), fields(domain))]
    pub async fn acquire(&self, url: &Url) {
        if self.delay.is_zero() {
            return;
        }
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let state = self
            .domains
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut last = state.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                let wait = self.delay.saturating_sub(elapsed);
                debug!(domain = %domain, delay_ms = wait.as_millis(), "politeness delay");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Lowercased host of `url`, or `"unknown"`.
#[must_use]
pub fn extract_domain(url: &Url) -> String {
    url.host_str()
        .map_or_else(|| "unknown".to_string(), str::to_lowercase)
}
