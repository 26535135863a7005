//! URL extraction and validation from text input.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};
use url::Url;

use super::error::{MAX_URL_LENGTH, ParseError};
use super::input::ParsedItem;

/// Regex pattern for finding URLs in free text.
/// Matches http, https and ftp URLs up to whitespace or common delimiters;
/// ftp candidates are found so they can be reported as unsupported.
#[allow(clippy::expect_used)]
static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:https?|ftp)://[^\s<>"'\]]+"#).expect("URL regex is valid") // Static pattern, safe to panic
});

/// Result type for URL extraction operations.
pub type UrlExtractionResult = Result<ParsedItem, ParseError>;

/// Extracts and validates every URL found in `input`.
///
/// Each candidate is validated individually, so some may succeed while others
/// fail.
///
/// # Examples
///
/// ```
/// use dlm_core::parser::extract_urls;
///
/// let results = extract_urls("Grab https://example.com/a.zip and ftp://example.com/b.iso");
/// assert_eq!(results.len(), 2);
/// assert!(results[0].is_ok());
/// assert!(results[1].is_err());
/// ```
#[tracing::instrument(skip(input), fields(input_len = input.len()))]
#[must_use]
pub fn extract_urls(input: &str) -> Vec<UrlExtractionResult> {
    let mut results = Vec::new();

    for url_match in URL_PATTERN.find_iter(input) {
        let raw_url = url_match.as_str();
        let cleaned = clean_url_trailing(raw_url);
        trace!(url = %cleaned, "found URL candidate");

        match validate_url(cleaned) {
            Ok(validated) => {
                results.push(Ok(ParsedItem::new(raw_url, validated.as_str(), None)));
            }
            Err(e) => {
                debug!(url = %cleaned, error = %e, "URL validation failed");
                results.push(Err(e));
            }
        }
    }

    results
}

/// Cleans trailing punctuation that often gets captured with URLs.
pub(crate) fn clean_url_trailing(url: &str) -> &str {
    let mut result = url;

    while let Some(last) = result.chars().last() {
        match last {
            // Sentence punctuation, not part of the URL
            '.' | ',' | ';' | ':' | '!' | '?' => {
                result = &result[..result.len() - 1];
            }
            // Closing parens/brackets at end are usually not part of URL
            ')' | ']' => {
                // Unless there's a matching opener in the URL (like Wikipedia URLs)
                let open = if last == ')' { '(' } else { '[' };
                let open_count = result.chars().filter(|&c| c == open).count();
                let close_count = result.chars().filter(|&c| c == last).count();
                if close_count > open_count {
                    result = &result[..result.len() - 1];
                } else {
                    break;
                }
            }
            _ => break,
        }
    }

    result
}

/// Validates a URL string for download and returns it normalized.
///
/// # Validation rules
/// - Must not exceed [`MAX_URL_LENGTH`]
/// - Must be parseable by the `url` crate
/// - Must use http or https; ftp and everything else is unsupported
/// - Must have a host
///
/// # Errors
///
/// Returns [`ParseError`] describing the first rule the input violates.
pub fn validate_url(raw: &str) -> Result<Url, ParseError> {
    let raw = raw.trim();
    if raw.len() > MAX_URL_LENGTH {
        return Err(ParseError::too_long(raw));
    }

    let parsed = Url::parse(raw).map_err(|e| ParseError::malformed(raw, &e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(ParseError::unsupported_scheme(raw, scheme)),
    }

    if parsed.host().is_none() {
        return Err(ParseError::no_host(raw));
    }

    Ok(parsed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== validate_url Tests ====================

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(validate_url("http://example.com/a.zip").is_ok());
        assert!(validate_url("https://example.com/a.zip").is_ok());
    }

    #[test]
    fn test_validate_url_rejects_ftp_as_unsupported() {
        let err = validate_url("ftp://mirror.example.com/a.iso").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedScheme { ref scheme, .. } if scheme == "ftp"));
    }

    #[test]
    fn test_validate_url_rejects_mailto() {
        assert!(validate_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_validate_url_rejects_relative() {
        let err = validate_url("/just/a/path").unwrap_err();
        assert!(matches!(err, ParseError::InvalidUrl { .. }));
    }

    #[test]
    fn test_validate_url_rejects_too_long() {
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(matches!(
            validate_url(&long),
            Err(ParseError::UrlTooLong { .. })
        ));
    }

    #[test]
    fn test_validate_url_trims_whitespace() {
        let url = validate_url("  https://example.com/a  ").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a");
    }

    // ==================== extract_urls Tests ====================

    #[test]
    fn test_extract_urls_empty_input() {
        assert!(extract_urls("").is_empty());
    }

    #[test]
    fn test_extract_urls_mixed_text_preserves_order() {
        let results = extract_urls("first https://a.example/1 then http://b.example/2.");
        let urls: Vec<_> = results.into_iter().map(|r| r.unwrap().url).collect();
        assert_eq!(urls, vec!["https://a.example/1", "http://b.example/2"]);
    }

    #[test]
    fn test_extract_urls_strips_trailing_punctuation() {
        let results = extract_urls("See https://example.com/page, and more");
        assert_eq!(results[0].as_ref().unwrap().url, "https://example.com/page");
    }

    #[test]
    fn test_extract_urls_preserves_wikipedia_style_parens() {
        let results = extract_urls("https://en.wikipedia.org/wiki/Rust_(programming_language)");
        assert_eq!(
            results[0].as_ref().unwrap().url,
            "https://en.wikipedia.org/wiki/Rust_(programming_language)"
        );
    }

    #[test]
    fn test_clean_url_trailing_drops_unbalanced_paren() {
        assert_eq!(
            clean_url_trailing("https://example.com/a.zip)"),
            "https://example.com/a.zip"
        );
    }
}
