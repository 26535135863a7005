//! Per-segment retry policy for transient transfer failures.
//!
//! # Overview
//!
//! When a segment request fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - Authentication required (never retried)
//! - [`FailureType::RateLimited`] - Server rate limiting (retried, honoring Retry-After)
//!
//! The [`RetryPolicy`] then decides whether the segment gets another attempt and
//! how long to wait first. Backoff is either fixed or exponential, as configured
//! in the connection settings; both add a small random jitter.
//!
//! # Example
//!
//! ```
//! use dlm_core::download::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://example.com/file.zip", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;
use crate::config::{Backoff, ConnectionSettings};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay between attempts (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Exponential backoff multiplier (doubles each attempt).
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry (reset, timeout, 5xx).
    Transient,
    /// Permanent failure (404, disk error, checksum mismatch).
    Permanent,
    /// 401/403/407; credentials are not managed, so never retried.
    NeedsAuth,
    /// HTTP 429; retried after the server's Retry-After when present.
    RateLimited,
}

/// Decision on whether to retry a failed segment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry budget and backoff shape for one segment.
///
/// # Delay Calculation
///
/// ```text
/// fixed:       delay = base_delay + jitter
/// exponential: delay = min(base_delay * 2^(attempt-1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff: Backoff,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES + 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff: Backoff::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first attempt.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            backoff,
            jitter: true,
        }
    }

    /// Builds the policy described by the connection settings.
    #[must_use]
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.retry_delay_ms),
            Duration::from_millis(settings.max_retry_delay_ms),
            settings.backoff,
        )
    }

    /// Disables random jitter, making delays deterministic.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let base_ms = self.base_delay.as_millis() as f64;
                let exponent = f64::from(attempt.saturating_sub(1));
                let delay_ms = base_ms * BACKOFF_MULTIPLIER.powf(exponent);
                let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
                Duration::from_millis(capped_ms as u64)
            }
        };

        if self.jitter {
            base + calculate_jitter()
        } else {
            base
        }
    }
}

/// Random jitter between 0 and `MAX_JITTER`, so segments that failed together
/// do not retry in lockstep.
#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | HTTP 408, 5xx | Transient |
/// | HTTP 429 | RateLimited |
/// | HTTP 401, 403, 407 | NeedsAuth |
/// | Other HTTP 4xx | Permanent |
/// | Timeout, early close | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | IO, invalid URL, ignored range, integrity | Permanent |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } | DownloadError::Incomplete { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::RangeIgnored { .. }
        | DownloadError::Integrity { .. }
        | DownloadError::Checksum { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 | 407 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        400..=499 => FailureType::Permanent,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and RFC 7231 HTTP-dates. Returns `None` if the
/// value cannot be parsed. Values above one hour are capped.
///
/// ```
/// use std::time::Duration;
/// use dlm_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(cap_retry_after(duration));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(datetime) => Some(
            datetime
                .duration_since(std::time::SystemTime::now())
                .map_or(Duration::ZERO, cap_retry_after),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        MAX_RETRY_AFTER
    } else {
        duration
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, Backoff::Fixed);
        assert_eq!(policy.max_attempts(), 1);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_from_settings_uses_configured_values() {
        let settings = ConnectionSettings {
            max_retries: 5,
            retry_delay_ms: 250,
            backoff: Backoff::Fixed,
            ..ConnectionSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings).without_jitter();
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Duration::from_millis(500),
            Backoff::Exponential,
        )
        .without_jitter();
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(300),
            Duration::from_secs(10),
            Backoff::Fixed,
        )
        .without_jitter();
        assert_eq!(policy.calculate_delay(1), policy.calculate_delay(5));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(1), Backoff::Fixed);
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(1) + MAX_JITTER);
        }
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO, Backoff::Fixed);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_retry_permanent_and_auth_never_retry() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::DoNotRetry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::NeedsAuth, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_http_statuses() {
        let cases = [
            (400, FailureType::Permanent),
            (401, FailureType::NeedsAuth),
            (403, FailureType::NeedsAuth),
            (404, FailureType::Permanent),
            (408, FailureType::Transient),
            (416, FailureType::Permanent),
            (429, FailureType::RateLimited),
            (500, FailureType::Transient),
            (503, FailureType::Transient),
        ];
        for (status, expected) in cases {
            let error = DownloadError::http_status("https://example.com", status);
            assert_eq!(classify_error(&error), expected, "status {status}");
        }
    }

    #[test]
    fn test_classify_transfer_errors() {
        assert_eq!(
            classify_error(&DownloadError::timeout("u")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&DownloadError::incomplete("u", 10)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&DownloadError::range_ignored("u", 10)),
            FailureType::Permanent
        );
        let io = std::io::Error::other("disk full");
        assert_eq!(
            classify_error(&DownloadError::io("/tmp/x", io)),
            FailureType::Permanent
        );
    }

    // ==================== Retry-After Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative_and_invalid() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date_past() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }
}
