//! Shared helpers for integration tests: byte-range file server and settings.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dlm_core::{DownloadManager, Settings, TaskStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic, non-repeating-per-segment test content.
pub fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Serves a fixed body and honors single `Range: bytes=a-b` requests.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    requests: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Request counter shared with the mounted responder.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.requests)
    }
}

fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    let range = header.trim().strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let total = self.body.len() as u64;
        let Some(header) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
        else {
            return ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(self.body.as_slice());
        };
        match parse_range(header, total) {
            Some((start, end)) => ResponseTemplate::new(206)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("Content-Range", format!("bytes {start}-{end}/{total}").as_str())
                .set_body_bytes(&self.body[start as usize..=end as usize]),
            None => ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{total}").as_str()),
        }
    }
}

/// Mounts `body` at `route` with range support; returns the request counter.
pub async fn serve_ranged(server: &MockServer, route: &str, body: Vec<u8>) -> Arc<AtomicUsize> {
    let responder = RangeResponder::new(body);
    let counter = responder.counter();
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
    counter
}

/// Mounts `body` at `route`, ignoring any Range header.
pub async fn serve_plain(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Mounts an HTML page at `route`.
pub async fn serve_html(server: &MockServer, route: &str, html: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(html.to_owned(), "text/html; charset=utf-8"),
        )
        .mount(server)
        .await;
}

/// Settings rooted at `dir` with fast retries and no persistence.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.general.download_directory = dir.join("downloads");
    settings.connection.max_retries = 1;
    settings.connection.retry_delay_ms = 10;
    settings.connection.max_retry_delay_ms = 20;
    settings.crawler.request_delay_ms = 0;
    settings
}

/// Builds and starts a manager without a task store.
pub fn started_manager(settings: Settings) -> Arc<DownloadManager> {
    let manager = Arc::new(
        DownloadManager::with_store(settings, None).expect("manager should build"),
    );
    manager.start();
    manager
}

/// Waits for a terminal status, failing the test after `limit`.
pub async fn wait_terminal(
    manager: &DownloadManager,
    id: dlm_core::TaskId,
    limit: Duration,
) -> TaskStatus {
    tokio::time::timeout(limit, manager.wait_for_download(id))
        .await
        .expect("download should finish in time")
        .expect("task should exist")
}
