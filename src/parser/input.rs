//! Types representing parsed input items and results.

use std::fmt;

/// A single validated URL taken from some input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    /// Original input text the URL came from.
    pub raw: String,
    /// Normalized, validated URL.
    pub url: String,
    /// 1-based line number when the input was line oriented.
    pub line: Option<usize>,
}

impl ParsedItem {
    /// Creates a parsed item.
    #[must_use]
    pub fn new(raw: impl Into<String>, url: impl Into<String>, line: Option<usize>) -> Self {
        Self {
            raw: raw.into(),
            url: url.into(),
            line,
        }
    }
}

impl fmt::Display for ParsedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// An input entry that was rejected, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedInput {
    /// Original input text.
    pub raw: String,
    /// Why it was rejected.
    pub reason: String,
    /// 1-based line number when the input was line oriented.
    pub line: Option<usize>,
}

impl fmt::Display for SkippedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {} ({})", self.raw, self.reason),
            None => write!(f, "{} ({})", self.raw, self.reason),
        }
    }
}

/// Collection of parsed items from input.
#[derive(Debug, Default, Clone)]
pub struct ParseResult {
    /// Successfully parsed items
    pub items: Vec<ParsedItem>,
    /// Entries that could not be parsed (for logging)
    pub skipped: Vec<SkippedInput>,
}

impl ParseResult {
    /// Creates a new empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a successfully parsed item.
    pub fn add_item(&mut self, item: ParsedItem) {
        self.items.push(item);
    }

    /// Adds a rejected entry.
    pub fn add_skipped(
        &mut self,
        raw: impl Into<String>,
        reason: impl Into<String>,
        line: Option<usize>,
    ) {
        self.skipped.push(SkippedInput {
            raw: raw.into(),
            reason: reason.into(),
            line,
        });
    }

    /// Returns true if no items were parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns count of parsed items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns count of skipped entries.
    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Returns the validated URLs in input order.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.url.as_str())
    }
}

impl fmt::Display for ParseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parsed {} items ({} skipped)",
            self.items.len(),
            self.skipped.len()
        )
    }
}
