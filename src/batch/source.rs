//! Bulk URL sources: text lists, HTML pages, CSV, sitemaps, remote lists and
//! numeric/alphabetic URL patterns.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument, warn};
use url::Url;

use super::BatchError;
use super::item::BatchItem;
use crate::crawler::{extract_link_targets, extract_links};
use crate::download::HttpClient;
use crate::parser::{
    ParseError, ParseResult, ParsedItem, SkippedInput, extract_urls, parse_input, validate_url,
};

/// Upper bound on URLs one pattern may expand to.
pub const MAX_PATTERN_EXPANSION: usize = 10_000;

#[allow(clippy::expect_used)]
static SITEMAP_LOC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<loc>\s*(?:<!\[CDATA\[)?(.*?)(?:\]\]>)?\s*</loc>")
        .expect("sitemap regex is valid")
});

/// A bulk URL source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSource {
    /// One URL per line; `#` comments.
    TextFile(PathBuf),
    /// Every `<a href>`/`<img src>` of a local HTML file.
    HtmlFile(PathBuf),
    /// Comma-separated rows with a URL column and an optional filename column.
    CsvFile(PathBuf),
    /// `<loc>` entries of a sitemap XML file.
    Sitemap(PathBuf),
    /// URLs given directly.
    List(Vec<String>),
    /// A remote list, page or sitemap.
    Http(String),
    /// A URL with `[1-10]`, `[01-10]` or `[a-z]` ranges.
    Pattern(String),
}

/// Items read from a source plus the entries that were rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSource {
    /// Accepted items, in source order.
    pub items: Vec<BatchItem>,
    /// Rejected entries.
    pub skipped: Vec<SkippedInput>,
}

impl From<ParseResult> for LoadedSource {
    fn from(result: ParseResult) -> Self {
        Self {
            items: result
                .items
                .into_iter()
                .map(|item| BatchItem::new(item.url))
                .collect(),
            skipped: result.skipped,
        }
    }
}

impl BatchSource {
    /// Picks the file source kind from the extension (`.html`, `.csv`, `.xml`;
    /// anything else is a text list).
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("html" | "htm" | "xhtml") => Self::HtmlFile(path),
            Some("csv") => Self::CsvFile(path),
            Some("xml") => Self::Sitemap(path),
            _ => Self::TextFile(path),
        }
    }

    /// Short name for logs and the CLI.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextFile(_) => "text",
            Self::HtmlFile(_) => "html",
            Self::CsvFile(_) => "csv",
            Self::Sitemap(_) => "sitemap",
            Self::List(_) => "list",
            Self::Http(_) => "http",
            Self::Pattern(_) => "pattern",
        }
    }

    /// Reads the source.
    ///
    /// Invalid entries never fail the load; they end up in
    /// [`LoadedSource::skipped`].
    ///
    /// # Errors
    ///
    /// - [`BatchError::Read`] when a file cannot be read
    /// - [`BatchError::Fetch`] when a remote list cannot be fetched
    /// - [`BatchError::Parse`] for an invalid remote URL or pattern
    #[instrument(skip(self, client), fields(kind = self.kind()))]
    pub async fn load(&self, client: &HttpClient) -> Result<LoadedSource, BatchError> {
        let loaded = match self {
            Self::TextFile(path) => parse_input(&read_file(path).await?).into(),
            Self::HtmlFile(path) => parse_html_links(&read_file(path).await?, None).into(),
            Self::CsvFile(path) => parse_csv(&read_file(path).await?),
            Self::Sitemap(path) => parse_sitemap(&read_file(path).await?).into(),
            Self::List(urls) => parse_list(urls).into(),
            Self::Http(raw) => {
                let url = validate_url(raw)?;
                let page = client.fetch_text(&url).await.map_err(BatchError::Fetch)?;
                let is_xml = page
                    .content_type
                    .as_deref()
                    .is_some_and(|ct| ct.ends_with("xml") && !ct.contains("xhtml"));
                if is_xml || page.body.contains("<urlset") || page.body.contains("<sitemapindex") {
                    parse_sitemap(&page.body).into()
                } else if page.content_type.is_some() && page.is_html() {
                    parse_html_links(&page.body, Some(&page.final_url)).into()
                } else {
                    parse_text_urls(&page.body).into()
                }
            }
            Self::Pattern(pattern) => {
                let expanded = expand_pattern(pattern)?;
                parse_list(&expanded).into()
            }
        };
        debug!(
            items = loaded.items.len(),
            skipped = loaded.skipped.len(),
            "loaded batch source"
        );
        Ok(loaded)
    }
}

async fn read_file(path: &Path) -> Result<String, BatchError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| BatchError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Validates each URL of a list.
#[must_use]
pub fn parse_list<S: AsRef<str>>(urls: &[S]) -> ParseResult {
    let mut result = ParseResult::new();
    for raw in urls {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        match validate_url(raw) {
            Ok(url) => result.add_item(ParsedItem::new(raw, url.as_str(), None)),
            Err(e) => {
                warn!(input = %raw, error = %e, "skipping invalid URL");
                result.add_skipped(raw, e.to_string(), None);
            }
        }
    }
    result
}

/// Every URL mentioned anywhere in a plain-text document.
#[must_use]
pub fn parse_text_urls(text: &str) -> ParseResult {
    let mut result = ParseResult::new();
    for extracted in extract_urls(text) {
        match extracted {
            Ok(item) => result.add_item(item),
            Err(e) => result.add_skipped(e.input(), e.to_string(), None),
        }
    }
    result
}

/// Links of an HTML document.
///
/// Without a `base`, only absolute links are accepted.
#[must_use]
pub fn parse_html_links(html: &str, base: Option<&Url>) -> ParseResult {
    match base {
        Some(base) => {
            let links: Vec<String> = extract_links(html, base)
                .into_iter()
                .map(String::from)
                .collect();
            parse_list(&links)
        }
        None => {
            let mut result = ParseResult::new();
            for target in extract_link_targets(html) {
                if let Ok(url) = validate_url(&target) {
                    result.add_item(ParsedItem::new(&target, url.as_str(), None));
                } else {
                    debug!(target = %target, "ignoring relative or unsupported link");
                }
            }
            result
        }
    }
}

/// `<loc>` entries of a sitemap.
#[must_use]
pub fn parse_sitemap(xml: &str) -> ParseResult {
    let locs: Vec<String> = SITEMAP_LOC
        .captures_iter(xml)
        .filter_map(|caps| caps.get(1))
        .map(|m| unescape_xml(m.as_str().trim()))
        .collect();
    parse_list(&locs)
}

fn unescape_xml(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Rows of a CSV document.
///
/// With a header row, the `url` column (or the first column whose name
/// contains "url") holds the URL, a `filename`/`name` column the filename and
/// a `destination`/`dir` column the target directory. Without one, the first
/// field that is a valid URL is used and the field after it, if any, is the
/// filename.
#[must_use]
pub fn parse_csv(text: &str) -> LoadedSource {
    let mut loaded = LoadedSource::default();
    let mut columns: Option<CsvColumns> = None;

    for (index, raw_line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_csv_line(line);

        // Only the first data-bearing line may be a header.
        if columns.is_none() && loaded.items.is_empty() && loaded.skipped.is_empty() {
            let lower: Vec<String> = fields.iter().map(|f| f.to_ascii_lowercase()).collect();
            let is_header = fields.iter().all(|f| validate_url(f).is_err())
                && lower.iter().any(|f| f.contains("url"));
            if is_header {
                let url_col = lower
                    .iter()
                    .position(|f| f == "url")
                    .or_else(|| lower.iter().position(|f| f.contains("url")));
                let name_col = lower
                    .iter()
                    .position(|f| f == "filename" || f == "name" || f == "file");
                let dest_col = lower
                    .iter()
                    .position(|f| f == "destination" || f == "dir" || f == "directory");
                columns = url_col.map(|url| CsvColumns {
                    url,
                    name: name_col,
                    destination: dest_col,
                });
                continue;
            }
        }

        let field = |col: Option<usize>| col.and_then(|c| fields.get(c).cloned());
        let (url_field, name_field, dest_field) = match &columns {
            Some(cols) => (
                field(Some(cols.url)),
                field(cols.name),
                field(cols.destination),
            ),
            None => match fields.iter().position(|f| validate_url(f).is_ok()) {
                Some(pos) => (field(Some(pos)), field(Some(pos + 1)), None),
                None => (fields.first().cloned(), None, None),
            },
        };

        let Some(raw_url) = url_field.filter(|u| !u.is_empty()) else {
            loaded.skipped.push(SkippedInput {
                raw: line.to_string(),
                reason: "no URL column".to_string(),
                line: Some(line_number),
            });
            continue;
        };
        match validate_url(&raw_url) {
            Ok(url) => {
                let mut item = BatchItem::new(url.as_str());
                if let Some(name) = name_field.filter(|n| !n.trim().is_empty()) {
                    item = item.with_filename(name.trim());
                }
                if let Some(dir) = dest_field.filter(|d| !d.trim().is_empty()) {
                    item = item.with_destination(dir.trim());
                }
                loaded.items.push(item);
            }
            Err(e) => {
                warn!(line = line_number, input = %line, error = %e, "skipping invalid CSV row");
                loaded.skipped.push(SkippedInput {
                    raw: line.to_string(),
                    reason: e.to_string(),
                    line: Some(line_number),
                });
            }
        }
    }
    loaded
}

/// Header positions of the CSV columns we read.
#[derive(Debug, Clone, Copy)]
struct CsvColumns {
    url: usize,
    name: Option<usize>,
    destination: Option<usize>,
}

/// Splits one CSV line, honoring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// One `[...]` range of a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternPart {
    Literal(String),
    Numeric { start: u64, end: u64, width: usize },
    Alpha { start: char, end: char },
}

impl PatternPart {
    fn len(&self) -> usize {
        match self {
            Self::Literal(_) => 1,
            Self::Numeric { start, end, .. } => {
                usize::try_from((end - start).saturating_add(1)).unwrap_or(usize::MAX)
            }
            Self::Alpha { start, end } => (*end as usize) - (*start as usize) + 1,
        }
    }

    fn values(&self) -> Vec<String> {
        match self {
            Self::Literal(text) => vec![text.clone()],
            Self::Numeric { start, end, width } => (*start..=*end)
                .map(|n| format!("{n:0width$}", width = *width))
                .collect(),
            Self::Alpha { start, end } => (*start..=*end).map(String::from).collect(),
        }
    }
}

fn parse_range(pattern: &str, body: &str) -> Result<PatternPart, ParseError> {
    let Some((lo, hi)) = body.split_once('-') else {
        return Err(ParseError::invalid_pattern(pattern, format!("range '[{body}]' has no '-'")));
    };
    let (lo, hi) = (lo.trim(), hi.trim());

    if !lo.is_empty()
        && !hi.is_empty()
        && lo.chars().all(|c| c.is_ascii_digit())
        && hi.chars().all(|c| c.is_ascii_digit())
    {
        let start: u64 = lo
            .parse()
            .map_err(|_| ParseError::invalid_pattern(pattern, format!("bad number '{lo}'")))?;
        let end: u64 = hi
            .parse()
            .map_err(|_| ParseError::invalid_pattern(pattern, format!("bad number '{hi}'")))?;
        if start > end {
            return Err(ParseError::invalid_pattern(pattern, format!("range [{body}] is reversed")));
        }
        // `[01-10]` pads to the width of the lower bound.
        let width = if lo.len() > 1 && lo.starts_with('0') {
            lo.len()
        } else {
            0
        };
        return Ok(PatternPart::Numeric { start, end, width });
    }

    let mut lo_chars = lo.chars();
    let mut hi_chars = hi.chars();
    if let (Some(start), None, Some(end), None) =
        (lo_chars.next(), lo_chars.next(), hi_chars.next(), hi_chars.next())
        && start.is_ascii_alphabetic()
        && end.is_ascii_alphabetic()
        && start.is_ascii_lowercase() == end.is_ascii_lowercase()
    {
        if start > end {
            return Err(ParseError::invalid_pattern(pattern, format!("range [{body}] is reversed")));
        }
        return Ok(PatternPart::Alpha { start, end });
    }

    Err(ParseError::invalid_pattern(
        pattern,
        format!("range '[{body}]' must be numeric or a single-letter span"),
    ))
}

fn parse_pattern(pattern: &str) -> Result<Vec<PatternPart>, ParseError> {
    let mut parts = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('[') {
        if open > 0 {
            parts.push(PatternPart::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 1..];
        let close = after
            .find(']')
            .ok_or_else(|| ParseError::invalid_pattern(pattern, "unclosed '['"))?;
        parts.push(parse_range(pattern, &after[..close])?);
        rest = &after[close + 1..];
    }
    if rest.contains(']') {
        return Err(ParseError::invalid_pattern(pattern, "unmatched ']'"));
    }
    if !rest.is_empty() {
        parts.push(PatternPart::Literal(rest.to_string()));
    }
    Ok(parts)
}

/// Expands every `[a-b]` range of `pattern`, leftmost range varying slowest.
///
/// # Errors
///
/// Returns [`ParseError::InvalidPattern`] for malformed ranges, patterns
/// without any range, and expansions above [`MAX_PATTERN_EXPANSION`].
///
/// # Example
///
/// ```
/// use dlm_core::batch::expand_pattern;
///
/// let urls = expand_pattern("https://example.com/img[01-03].jpg").unwrap();
/// assert_eq!(urls[0], "https://example.com/img01.jpg");
/// assert_eq!(urls.len(), 3);
/// ```
pub fn expand_pattern(pattern: &str) -> Result<Vec<String>, ParseError> {
    let parts = parse_pattern(pattern)?;
    if parts.iter().all(|p| matches!(p, PatternPart::Literal(_))) {
        return Err(ParseError::invalid_pattern(pattern, "no [range] found"));
    }
    let total = parts
        .iter()
        .try_fold(1usize, |acc, part| acc.checked_mul(part.len()))
        .filter(|total| *total <= MAX_PATTERN_EXPANSION)
        .ok_or_else(|| {
            ParseError::invalid_pattern(
                pattern,
                format!("expands to more than {MAX_PATTERN_EXPANSION} URLs"),
            )
        })?;

    let mut expanded = vec![String::new()];
    for part in &parts {
        let values = part.values();
        expanded = expanded
            .iter()
            .flat_map(|prefix| values.iter().map(move |v| format!("{prefix}{v}")))
            .collect();
    }
    debug_assert_eq!(expanded.len(), total);
    Ok(expanded)
}
