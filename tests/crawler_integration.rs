//! Integration tests for the website crawler.

mod support;

use std::sync::Arc;
use std::time::Duration;

use dlm_core::events::CrawlEvent;
use dlm_core::{CrawlConfig, CrawlState, HttpClient, TaskStatus, WebsiteCrawler};
use support::{patterned_body, serve_html, serve_ranged, started_manager, test_settings};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(start: String, max_depth: usize) -> CrawlConfig {
    let mut config = CrawlConfig::new(start);
    config.max_depth = max_depth;
    config.request_delay = Duration::ZERO;
    config
}

async fn run(crawler: &WebsiteCrawler, config: CrawlConfig) {
    crawler.start(config).expect("crawl should start");
    tokio::time::timeout(Duration::from_secs(30), crawler.wait())
        .await
        .expect("crawl should finish");
}

#[tokio::test]
async fn test_link_cycle_visits_each_page_once() {
    let server = MockServer::start().await;
    serve_html(&server, "/a.html", r#"<a href="/b.html">b</a>"#).await;
    serve_html(&server, "/b.html", r#"<a href="c.html">c</a>"#).await;
    serve_html(&server, "/c.html", r#"<a href="/a.html#top">a</a>"#).await;
    let crawler = WebsiteCrawler::new(HttpClient::new());
    let mut events = crawler.subscribe();

    run(&crawler, config(format!("{}/a.html", server.uri()), 2)).await;

    let uri = server.uri();
    assert_eq!(
        crawler.visited_urls(),
        vec![
            format!("{uri}/a.html"),
            format!("{uri}/b.html"),
            format!("{uri}/c.html"),
        ]
    );
    assert_eq!(crawler.state(), CrawlState::Stopped);
    assert_eq!(crawler.progress().pages_visited, 3);

    let mut finished = false;
    while let Ok(event) = events.try_recv() {
        if let CrawlEvent::Finished(progress) = event {
            assert_eq!(progress.pages_visited, 3);
            finished = true;
        }
    }
    assert!(finished, "a Finished event should be sent");
}

#[tokio::test]
async fn test_depth_zero_visits_only_the_seed() {
    let server = MockServer::start().await;
    serve_html(&server, "/", r#"<a href="/next.html">next</a>"#).await;
    serve_html(&server, "/next.html", "<p>leaf</p>").await;
    let crawler = WebsiteCrawler::new(HttpClient::new());

    run(&crawler, config(format!("{}/", server.uri()), 0)).await;

    assert_eq!(crawler.visited_urls(), vec![format!("{}/", server.uri())]);
}

#[tokio::test]
async fn test_robots_txt_disallow_is_respected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"),
        )
        .mount(&server)
        .await;
    serve_html(
        &server,
        "/",
        r#"<a href="/private/secret.html">s</a> <a href="/public.html">p</a>"#,
    )
    .await;
    serve_html(&server, "/public.html", "ok").await;
    serve_html(&server, "/private/secret.html", "hidden").await;
    let crawler = WebsiteCrawler::new(HttpClient::new());

    run(&crawler, config(format!("{}/", server.uri()), 2)).await;

    let visited = crawler.visited_urls();
    assert!(visited.contains(&format!("{}/public.html", server.uri())));
    assert!(!visited.iter().any(|u| u.contains("/private/")), "visited: {visited:?}");

    // The same crawl with robots.txt ignored reaches the private page.
    let mut ignore = config(format!("{}/", server.uri()), 2);
    ignore.respect_robots_txt = false;
    run(&crawler, ignore).await;
    assert!(crawler.visited_urls().iter().any(|u| u.contains("/private/")));
}

#[tokio::test]
async fn test_external_links_are_not_followed() {
    let server = MockServer::start().await;
    serve_html(
        &server,
        "/",
        r#"<a href="http://elsewhere.invalid/page.html">away</a> <a href="/home.html">home</a>"#,
    )
    .await;
    serve_html(&server, "/home.html", "home").await;
    let crawler = WebsiteCrawler::new(HttpClient::new());

    run(&crawler, config(format!("{}/", server.uri()), 3)).await;

    let visited = crawler.visited_urls();
    assert_eq!(visited.len(), 2);
    assert!(visited.iter().all(|u| u.starts_with(&server.uri())));
}

#[tokio::test]
async fn test_max_pages_caps_the_crawl() {
    let server = MockServer::start().await;
    let links: String = (0..10).map(|i| format!(r#"<a href="/p{i}.html">{i}</a>"#)).collect();
    serve_html(&server, "/", &links).await;
    for i in 0..10 {
        serve_html(&server, &format!("/p{i}.html"), "leaf").await;
    }
    let crawler = WebsiteCrawler::new(HttpClient::new());
    let mut crawl = config(format!("{}/", server.uri()), 2);
    crawl.max_pages = 4;

    run(&crawler, crawl).await;

    assert_eq!(crawler.visited_urls().len(), 4);
}

#[tokio::test]
async fn test_found_files_are_downloaded() {
    let server = MockServer::start().await;
    serve_html(
        &server,
        "/docs/",
        r#"<a href="manual.pdf">manual</a> <img src="/img/logo.png"> <a href="/docs/about.html">about</a>"#,
    )
    .await;
    serve_html(&server, "/docs/about.html", "about").await;
    serve_ranged(&server, "/docs/manual.pdf", patterned_body(4096)).await;
    serve_ranged(&server, "/img/logo.png", patterned_body(512)).await;
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let manager = started_manager(test_settings(temp_dir.path()));
    let crawler = WebsiteCrawler::with_manager(Arc::clone(&manager));

    let mut crawl = config(format!("{}/docs/", server.uri()), 1);
    crawl.auto_download = true;
    crawl.destination = Some(temp_dir.path().join("crawled"));
    run(&crawler, crawl).await;

    let mut files = crawler.downloadable_files();
    files.sort();
    assert_eq!(
        files,
        vec![
            format!("{}/docs/manual.pdf", server.uri()),
            format!("{}/img/logo.png", server.uri()),
        ]
    );
    assert_eq!(crawler.progress().downloads_queued, 2);

    for task in manager.tasks() {
        let status = tokio::time::timeout(Duration::from_secs(30), manager.wait_for_download(task.id))
            .await
            .expect("download should finish")
            .expect("task should exist");
        assert_eq!(status, TaskStatus::Completed);
    }
    assert!(temp_dir.path().join("crawled").join("manual.pdf").exists());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_pause_holds_workers_until_resume() {
    let server = MockServer::start().await;
    let links: String = (0..8).map(|i| format!(r#"<a href="/s{i}.html">{i}</a>"#)).collect();
    serve_html(&server, "/", &links).await;
    for i in 0..8 {
        Mock::given(method("GET"))
            .and(path(format!("/s{i}.html")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("leaf", "text/html")
                    .set_delay(Duration::from_millis(100)),
            )
            .mount(&server)
            .await;
    }
    let crawler = WebsiteCrawler::new(HttpClient::new());
    let mut crawl = config(format!("{}/", server.uri()), 2);
    crawl.respect_robots_txt = false;
    crawl.concurrency = 1;

    crawler.start(crawl).expect("crawl should start");
    tokio::time::timeout(Duration::from_secs(10), async {
        while crawler.visited_urls().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("crawl should make progress");
    assert!(crawler.pause());
    assert_eq!(crawler.state(), CrawlState::Paused);

    // Let the page in flight finish, then nothing more is visited.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let held = crawler.visited_urls().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(crawler.visited_urls().len(), held);
    assert!(held < 9, "paused crawl visited {held} pages");
    assert!(crawler.is_running());

    assert!(crawler.resume());
    tokio::time::timeout(Duration::from_secs(10), crawler.wait())
        .await
        .expect("crawl should finish after resume");
    assert_eq!(crawler.visited_urls().len(), 9);
    assert_eq!(crawler.state(), CrawlState::Stopped);
}

#[tokio::test]
async fn test_stop_ends_a_running_crawl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<a href=\"/x.html\">x</a>")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let crawler = WebsiteCrawler::new(HttpClient::new());
    let mut crawl = config(format!("{}/slow.html", server.uri()), 2);
    crawl.respect_robots_txt = false;

    crawler.start(crawl).expect("crawl should start");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(crawler.is_running());
    tokio::time::timeout(Duration::from_secs(2), crawler.stop())
        .await
        .expect("stop should not wait for the slow page");
    assert_eq!(crawler.state(), CrawlState::Stopped);
}
