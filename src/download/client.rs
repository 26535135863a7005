//! HTTP client wrapper used by segment workers, the crawler and batch sources.
//!
//! The wrapper owns one pooled `reqwest::Client` and exposes the three requests
//! the core needs: a resumability probe, a byte-range fetch and a text fetch.

use std::time::Duration;

use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use super::filename::{filename_from_url, parse_content_disposition, sanitize_filename};
use crate::config::ConnectionSettings;
use crate::user_agent;

/// HTTP client shared by every component.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// What a probe learned about a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Total size in bytes, if the server disclosed it.
    pub total_size: Option<u64>,
    /// Whether the server honors byte-range requests.
    pub resumable: bool,
    /// Filename from Content-Disposition, or the final URL's last segment.
    pub filename: String,
}

/// Response to a ranged GET.
#[derive(Debug)]
pub struct RangeResponse {
    /// `true` when the server answered 206 Partial Content.
    pub partial: bool,
    /// The response whose body is streamed by the caller.
    pub response: reqwest::Response,
}

/// A fetched text document.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects; relative links resolve against it.
    pub final_url: Url,
    /// Media type without parameters, lowercased.
    pub content_type: Option<String>,
    /// Decoded body.
    pub body: String,
}

impl FetchedPage {
    /// Returns true when the document is HTML (or has no declared type).
    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .is_none_or(|ct| ct == "text/html" || ct == "application/xhtml+xml")
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts and User-Agent.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static configuration,
    /// which only happens when the TLS backend cannot initialize.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::build(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, None)
            .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client from the connection settings.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the client cannot be constructed.
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self, reqwest::Error> {
        Self::build(
            settings.connect_timeout_secs,
            settings.read_timeout_secs,
            settings.user_agent.as_deref(),
        )
    }

    fn build(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
        user_agent: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let user_agent = user_agent.map_or_else(user_agent::default_user_agent, str::to_string);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Discovers size, range support and filename with a one-byte ranged GET.
    ///
    /// A `206` with `Content-Range: bytes 0-0/N` means resumable with size N.
    /// A `200` means the server ignores ranges; Content-Length (if any) is the size.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures and non-success statuses.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn probe(&self, url: &Url) -> Result<ProbeResult, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(|e| DownloadError::network(url.as_str(), e))?;

        let status = response.status();
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let (total_size, resumable) = if status == StatusCode::PARTIAL_CONTENT {
            (content_range_total, content_range_total.is_some())
        } else if status == StatusCode::RANGE_NOT_SATISFIABLE && content_range_total == Some(0) {
            // Empty resource: "bytes */0".
            (Some(0), false)
        } else if status.is_success() {
            let length = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            (length, false)
        } else {
            return Err(status_error(url, &response));
        };

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition)
            .map_or_else(|| filename_from_url(response.url()), |name| sanitize_filename(&name));

        debug!(
            status = status.as_u16(),
            total_size,
            resumable,
            filename = %filename,
            "probe complete"
        );
        Ok(ProbeResult {
            total_size,
            resumable,
            filename,
        })
    }

    /// Starts a GET for bytes `[start, end)`; `end = None` reads to the end.
    ///
    /// No Range header is sent for a full read from offset 0.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures and non-success statuses.
    pub async fn fetch_range(
        &self,
        url: &Url,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, DownloadError> {
        let mut request = self.client.get(url.clone());
        match end {
            Some(end) => request = request.header(RANGE, format!("bytes={start}-{}", end.saturating_sub(1))),
            None if start > 0 => request = request.header(RANGE, format!("bytes={start}-")),
            None => {}
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::network(url.as_str(), e))?;
        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }
        Ok(RangeResponse {
            partial: response.status() == StatusCode::PARTIAL_CONTENT,
            response,
        })
    }

    /// Fetches a text document (crawler pages, remote URL lists).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures and non-success statuses.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch_text(&self, url: &Url) -> Result<FetchedPage, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DownloadError::network(url.as_str(), e))?;
        if !response.status().is_success() {
            return Err(status_error(url, &response));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::network(url.as_str(), e))?;

        Ok(FetchedPage {
            final_url,
            content_type,
            body,
        })
    }
}

fn status_error(url: &Url, response: &reqwest::Response) -> DownloadError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    DownloadError::http_status_with_retry_after(
        url.as_str(),
        response.status().as_u16(),
        retry_after,
    )
}

/// Extracts the complete length from `bytes 0-0/1234` or `bytes */1234`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
