//! Link extraction from HTML.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::download::filename::extension_from_url;

/// `<a href=...>` with double, single or no quotes.
#[allow(clippy::expect_used)]
static ANCHOR_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("anchor regex is valid")
});

/// `<img src=...>` with double, single or no quotes.
#[allow(clippy::expect_used)]
static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<img\b[^>]*?\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("img regex is valid")
});

const SKIPPED_SCHEMES: [&str; 4] = ["mailto:", "javascript:", "tel:", "data:"];

/// Raw `href`/`src` attribute values in document order, entity-decoded.
#[must_use]
pub fn extract_link_targets(html: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for re in [&*ANCHOR_HREF, &*IMG_SRC] {
        for caps in re.captures_iter(html) {
            let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
                continue;
            };
            let target = decode_entities(value.as_str().trim());
            if !target.is_empty() {
                found.push((value.start(), target));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, t)| t).collect()
}

/// Absolute, fragment-free HTTP(S) links found in `html`, deduplicated.
///
/// Relative targets resolve against `base`. `mailto:`, `javascript:`, `tel:`
/// and `data:` targets and bare fragments are dropped.
#[must_use]
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for target in extract_link_targets(html) {
        if target.starts_with('#') {
            continue;
        }
        let lower = target.to_ascii_lowercase();
        if SKIPPED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
            continue;
        }
        let Ok(mut url) = base.join(&target) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        url.set_fragment(None);
        if seen.insert(url.as_str().to_string()) {
            links.push(url);
        }
    }
    links
}

/// Returns true when the URL's path ends in one of `extensions` (no dot, any case).
#[must_use]
pub fn is_downloadable(url: &Url, extensions: &[String]) -> bool {
    extension_from_url(url).is_some_and(|ext| {
        extensions
            .iter()
            .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    })
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/docs/index.html").unwrap()
    }

    // ==================== extract_link_targets ====================

    #[test]
    fn test_targets_in_document_order() {
        let html = r#"<img src="logo.png"><a href='/a'>A</a><a class=x href=b.html>B</a>"#;
        assert_eq!(extract_link_targets(html), vec!["logo.png", "/a", "b.html"]);
    }

    #[test]
    fn test_targets_decode_ampersand() {
        let html = r#"<a href="/q?a=1&amp;b=2">q</a>"#;
        assert_eq!(extract_link_targets(html), vec!["/q?a=1&b=2"]);
    }

    #[test]
    fn test_targets_case_insensitive_tags() {
        let html = r#"<A HREF="/upper">x</A>"#;
        assert_eq!(extract_link_targets(html), vec!["/upper"]);
    }

    // ==================== extract_links ====================

    #[test]
    fn test_relative_links_resolve_against_base() {
        let html = r#"<a href="guide.html">g</a><a href="../top.html">t</a>"#;
        let links = extract_links(html, &base());
        assert_eq!(links[0].as_str(), "https://example.com/docs/guide.html");
        assert_eq!(links[1].as_str(), "https://example.com/top.html");
    }

    #[test]
    fn test_skipped_schemes_and_fragments() {
        let html = r##"
            <a href="mailto:me@example.com">m</a>
            <a href="JavaScript:void(0)">j</a>
            <a href="tel:123">t</a>
            <img src="data:image/png;base64,AAAA">
            <a href="#top">top</a>
            <a href="ftp://example.com/f">f</a>
            <a href="/kept#section">k</a>
        "##;
        let links = extract_links(html, &base());
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://example.com/kept");
    }

    #[test]
    fn test_links_deduplicated_after_fragment_strip() {
        let html = r#"<a href="/p#a">1</a><a href="/p#b">2</a><a href="/p">3</a>"#;
        assert_eq!(extract_links(html, &base()).len(), 1);
    }

    // ==================== is_downloadable ====================

    #[test]
    fn test_is_downloadable() {
        let exts = vec!["zip".to_string(), ".PDF".to_string()];
        assert!(is_downloadable(&Url::parse("https://e.com/a.ZIP").unwrap(), &exts));
        assert!(is_downloadable(&Url::parse("https://e.com/doc.pdf?x=1").unwrap(), &exts));
        assert!(!is_downloadable(&Url::parse("https://e.com/page.html").unwrap(), &exts));
        assert!(!is_downloadable(&Url::parse("https://e.com/dir/").unwrap(), &exts));
    }
}
