//! Error types for URL validation and input parsing.

use thiserror::Error;

/// Maximum URL length to accept (standard browser limit).
pub const MAX_URL_LENGTH: usize = 2000;

/// Errors that can occur while validating user-supplied URLs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// URL is malformed or has no host.
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL that failed validation.
        url: String,
        /// Why the URL is invalid.
        reason: String,
    },

    /// URL parsed but its scheme cannot be transferred.
    #[error("unsupported scheme '{scheme}' in '{url}' (use http:// or https://)")]
    UnsupportedScheme {
        /// The offending URL.
        url: String,
        /// The scheme that was found.
        scheme: String,
    },

    /// URL exceeds [`MAX_URL_LENGTH`].
    #[error("URL too long ({length} chars, max {max}): {url_preview}...")]
    UrlTooLong {
        /// Truncated URL for display.
        url_preview: String,
        /// Actual length.
        length: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// A `[start-end]` range in a URL pattern could not be expanded.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The full pattern.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ParseError {
    /// Creates an `UnsupportedScheme` error.
    #[must_use]
    pub fn unsupported_scheme(url: &str, scheme: &str) -> Self {
        Self::UnsupportedScheme {
            url: url.to_string(),
            scheme: scheme.to_string(),
        }
    }

    /// Creates an `InvalidUrl` error for a URL the `url` crate rejected.
    #[must_use]
    pub fn malformed(url: &str, parse_error: &str) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: parse_error.to_string(),
        }
    }

    /// Creates an `InvalidUrl` error for a URL without a host.
    #[must_use]
    pub fn no_host(url: &str) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: "URL has no host".to_string(),
        }
    }

    /// Creates a `UrlTooLong` error.
    #[must_use]
    pub fn too_long(url: &str) -> Self {
        Self::UrlTooLong {
            url_preview: url.chars().take(50).collect(),
            length: url.len(),
            max: MAX_URL_LENGTH,
        }
    }

    /// The rejected input, truncated for `UrlTooLong`.
    #[must_use]
    pub fn input(&self) -> &str {
        match self {
            Self::InvalidUrl { url, .. } | Self::UnsupportedScheme { url, .. } => url,
            Self::UrlTooLong { url_preview, .. } => url_preview,
            Self::InvalidPattern { pattern, .. } => pattern,
        }
    }

    /// Creates an `InvalidPattern` error.
    #[must_use]
    pub fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_unsupported_scheme_message() {
        let err = ParseError::unsupported_scheme("ftp://example.com/a.iso", "ftp");
        let msg = err.to_string();
        assert!(msg.contains("ftp://example.com/a.iso"));
        assert!(msg.contains("'ftp'"));
        assert!(msg.contains("https://"));
    }

    #[test]
    fn test_parse_error_malformed_message() {
        let err = ParseError::malformed("not-a-url", "relative URL without a base");
        let msg = err.to_string();
        assert!(msg.contains("not-a-url"));
        assert!(msg.contains("relative URL"));
    }

    #[test]
    fn test_parse_error_too_long_message() {
        let long_url = "https://example.com/".to_string() + &"a".repeat(2500);
        let msg = ParseError::too_long(&long_url).to_string();
        assert!(msg.contains("too long"));
        assert!(msg.contains("2000"));
    }

    #[test]
    fn test_parse_error_input_returns_offending_text() {
        let err = ParseError::unsupported_scheme("ftp://example.com/a.iso", "ftp");
        assert_eq!(err.input(), "ftp://example.com/a.iso");
        assert_eq!(ParseError::invalid_pattern("a[1-", "unclosed").input(), "a[1-");
    }
}
