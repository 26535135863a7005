//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so that a failed task's
//! error message is useful on its own.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while probing or transferring a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (429/503 responses).
        retry_after: Option<String>,
    },

    /// The server ended a byte range before all of it was delivered.
    #[error("connection closed early downloading {url}: expected {expected} more bytes")]
    Incomplete {
        /// The URL being downloaded.
        url: String,
        /// Bytes that were still outstanding.
        expected: u64,
    },

    /// The server ignored a Range request for a non-zero offset.
    #[error("server ignored range request at offset {offset} for {url}")]
    RangeIgnored {
        /// The URL being downloaded.
        url: String,
        /// The requested start offset.
        offset: u64,
    },

    /// File system error during download (create file, write, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Downloaded file size does not match the size the server announced.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Download path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// Downloaded file does not hash to the expected SHA-256 digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        /// Download path that failed verification.
        path: PathBuf,
        /// Expected lowercase hex digest.
        expected: String,
        /// Computed lowercase hex digest.
        actual: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, mapping timeouts to [`Self::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an early-close error.
    pub fn incomplete(url: impl Into<String>, expected: u64) -> Self {
        Self::Incomplete {
            url: url.into(),
            expected,
        }
    }

    /// Creates a range-ignored error.
    pub fn range_ignored(url: impl Into<String>, offset: u64) -> Self {
        Self::RangeIgnored {
            url: url.into(),
            offset,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a size mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum(
        path: impl Into<PathBuf>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Checksum {
            path: path.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns the Retry-After header value carried by an HTTP status error.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs a url or
// path that the source error does not carry. Use the helper constructors.
