//! Filename extraction, sanitization, and path resolution for downloads.

use std::path::{Component, Path, PathBuf};

use url::Url;

/// Suffix of the in-progress file a transfer writes into.
pub(crate) const PART_SUFFIX: &str = ".part";

/// Returns the `.part` path used while `final_path` is being downloaded.
#[must_use]
pub(crate) fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Extracts the lowercase extension (without dot) of the URL's last path segment.
#[must_use]
pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let last_segment = url.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index + 1..];
    if ext.is_empty() || ext.len() > 11 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.zip"`
/// - `attachment; filename=example.zip`
/// - `attachment; filename*=UTF-8''example.zip` (RFC 5987, preferred)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        // Format: charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let value = header[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) with `_`.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized.replace('.', "_")
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Filename derived from the URL's last path segment, or `download.bin`.
pub(crate) fn filename_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        return sanitize_filename(&decoded);
    }
    "download.bin".to_string()
}

/// Resolves a path in `dir` that no file, partial file, or reservation claims.
///
/// `file.zip` becomes `file_1.zip`, `file_2.zip`, ... on conflict. A name is
/// taken when the final file exists, when its `.part` exists, or when
/// `is_reserved` reports another task already owns it.
pub(crate) fn resolve_unique_path(
    dir: &Path,
    filename: &str,
    is_reserved: impl Fn(&Path) -> bool,
) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.trim_matches('_').is_empty() {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let taken = |path: &Path| path.exists() || part_path(path).exists() || is_reserved(path);

    let base_path = dir.join(&filename);
    if !taken(&base_path) {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename.as_str(), ""),
    };

    for i in 1..10_000 {
        let candidate = dir.join(format!("{stem}_{i}{ext}"));
        if !taken(&candidate) {
            return candidate;
        }
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ==================== Sanitization ====================

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.zip"), "file_name.zip");
        assert_eq!(sanitize_filename("file\\name.zip"), "file_name.zip");
        assert_eq!(sanitize_filename("a:b*c?.iso"), "a_b_c_.iso");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename("."), "_");
    }

    #[test]
    fn test_sanitize_filename_preserves_unicode() {
        assert_eq!(sanitize_filename("résumé.pdf"), "résumé.pdf");
    }

    // ==================== Content-Disposition ====================

    #[test]
    fn test_parse_content_disposition_quoted() {
        assert_eq!(
            parse_content_disposition("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_unquoted_with_semicolon() {
        assert_eq!(
            parse_content_disposition("attachment; filename=data.csv; size=10"),
            Some("data.csv".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_rfc5987_preferred() {
        assert_eq!(
            parse_content_disposition(
                "attachment; filename=\"fallback.zip\"; filename*=UTF-8''na%C3%AFve%20file.zip"
            ),
            Some("naïve file.zip".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_missing() {
        assert_eq!(parse_content_disposition("inline"), None);
    }

    // ==================== URL Helpers ====================

    #[test]
    fn test_filename_from_url_decodes_last_segment() {
        let url = Url::parse("https://example.com/files/my%20archive.tar.gz?x=1").unwrap();
        assert_eq!(filename_from_url(&url), "my archive.tar.gz");
    }

    #[test]
    fn test_filename_from_url_without_path() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&url), "download.bin");
    }

    #[test]
    fn test_extension_from_url() {
        let url = Url::parse("https://example.com/a/B.ZIP").unwrap();
        assert_eq!(extension_from_url(&url), Some("zip".to_string()));
        let url = Url::parse("https://example.com/a/readme").unwrap();
        assert_eq!(extension_from_url(&url), None);
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/a.zip")),
            PathBuf::from("/tmp/a.zip.part")
        );
    }

    // ==================== Unique Paths ====================

    #[test]
    fn test_resolve_unique_path_no_conflict() {
        let dir = TempDir::new().unwrap();
        let path = resolve_unique_path(dir.path(), "a.zip", |_| false);
        assert_eq!(path, dir.path().join("a.zip"));
    }

    #[test]
    fn test_resolve_unique_path_skips_existing_and_partial() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.zip"), b"x").unwrap();
        std::fs::write(dir.path().join("a_1.zip.part"), b"x").unwrap();
        let path = resolve_unique_path(dir.path(), "a.zip", |_| false);
        assert_eq!(path, dir.path().join("a_2.zip"));
    }

    #[test]
    fn test_resolve_unique_path_honors_reservations() {
        let dir = TempDir::new().unwrap();
        let reserved = dir.path().join("a.zip");
        let path = resolve_unique_path(dir.path(), "a.zip", |p| p == reserved);
        assert_eq!(path, dir.path().join("a_1.zip"));
    }

    #[test]
    fn test_resolve_unique_path_protects_against_traversal() {
        let dir = TempDir::new().unwrap();
        let path = resolve_unique_path(dir.path(), "../../etc/passwd", |_| false);
        assert!(path.starts_with(dir.path()));
    }
}
