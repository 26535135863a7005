//! Input parsing: URL validation and line-oriented URL lists.
//!
//! Every front-end that accepts URLs from a user (CLI arguments, batch text
//! files, HTTP-fetched lists) goes through [`validate_url`] so that invalid
//! entries are rejected before a task is ever created.

mod error;
mod input;
mod url;

pub use error::{MAX_URL_LENGTH, ParseError};
pub use input::{ParseResult, ParsedItem, SkippedInput};
pub use url::{UrlExtractionResult, extract_urls, validate_url};

use tracing::{debug, warn};

/// Parses a line-oriented URL list.
///
/// Blank lines and lines starting with `#` are ignored. The first
/// whitespace-separated token on every other line must be a valid URL;
/// anything else is skipped with a warning and recorded in
/// [`ParseResult::skipped`].
///
/// # Example
///
/// ```
/// use dlm_core::parser::parse_input;
///
/// let result = parse_input("https://example.com/a.zip\nnot a url\n# comment\n");
/// assert_eq!(result.len(), 1);
/// assert_eq!(result.skipped_count(), 1);
/// ```
#[tracing::instrument(skip(input), fields(input_len = input.len()))]
#[must_use]
pub fn parse_input(input: &str) -> ParseResult {
    let mut result = ParseResult::new();

    for (index, raw_line) in input.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let candidate = line.split_whitespace().next().unwrap_or(line);
        match validate_url(candidate) {
            Ok(url) => result.add_item(ParsedItem::new(line, url.as_str(), Some(line_number))),
            Err(e) => {
                warn!(line = line_number, input = %line, error = %e, "skipping invalid URL line");
                result.add_skipped(line, e.to_string(), Some(line_number));
            }
        }
    }

    debug!(
        items = result.len(),
        skipped = result.skipped_count(),
        "parsed URL list"
    );
    result
}
