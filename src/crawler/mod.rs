//! Breadth-first website crawler.
//!
//! A crawl starts from a seed URL and walks links level by level. Pages are
//! fetched only while their depth is below `max_depth`, links whose path ends
//! in a downloadable extension are recorded as resources and never expanded,
//! and the number of visited URLs never exceeds `max_pages`.
//!
//! Workers share one FIFO frontier. With `concurrency == 1` the visit order
//! is strict breadth-first. Fetch failures, robots.txt problems and invalid
//! filter patterns are logged and skipped; they never abort a crawl.
//!
//! # Example
//!
//! ```no_run
//! use dlm_core::crawler::{CrawlConfig, WebsiteCrawler};
//! use dlm_core::download::HttpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let crawler = WebsiteCrawler::new(HttpClient::new());
//! let mut config = CrawlConfig::new("https://example.com/");
//! config.max_depth = 1;
//! crawler.start(config)?;
//! let progress = crawler.wait().await;
//! println!("{progress:?} -> {:?}", crawler.downloadable_files());
//! # Ok(())
//! # }
//! ```

mod links;
mod politeness;
mod robots;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::CrawlerSettings;
use crate::download::HttpClient;
use crate::download::constants::EVENT_CHANNEL_CAPACITY;
use crate::events::{CrawlEvent, CrawlProgress};
use crate::manager::{DownloadManager, DownloadRequest};
use crate::parser::{ParseError, validate_url};

pub use links::{extract_link_targets, extract_links, is_downloadable};
pub use politeness::{PolitenessDelay, extract_domain};
pub use robots::{RobotsCache, RobotsDecision, origin_for_robots};

/// Errors returned when starting a crawl.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The seed URL was rejected.
    #[error(transparent)]
    Url(#[from] ParseError),

    /// A crawl is already running or paused.
    #[error("a crawl is already in progress")]
    AlreadyRunning,
}

/// Lifecycle of a crawler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlState {
    /// No crawl has been started.
    #[default]
    Idle,
    /// Workers are fetching pages.
    Running,
    /// Workers are parked until resumed.
    Paused,
    /// The last crawl finished or was stopped.
    Stopped,
}

impl CrawlState {
    /// Lowercase name for status output.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for CrawlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which hosts a crawl may traverse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainScope {
    /// The seed host and its subdomains.
    #[default]
    SameDomain,
    /// Exactly the seed host.
    SameHost,
    /// The listed domains and their subdomains.
    SpecifiedDomains(Vec<String>),
    /// Any host; foreign hosts still require `follow_external_links`.
    FollowAll,
}

impl FromStr for DomainScope {
    type Err = String;

    /// Parses `same-domain`, `same-host`, `all`, or a comma-separated domain list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "same-domain" | "same_domain" | "domain" => Ok(Self::SameDomain),
            "same-host" | "same_host" | "host" => Ok(Self::SameHost),
            "all" | "follow-all" | "follow_all" => Ok(Self::FollowAll),
            "" => Err("empty scope".to_string()),
            list => {
                let domains: Vec<String> = list
                    .split(',')
                    .map(|d| d.trim().trim_start_matches('.').to_string())
                    .filter(|d| !d.is_empty())
                    .collect();
                if domains.is_empty() {
                    Err(format!("invalid scope '{s}'"))
                } else {
                    Ok(Self::SpecifiedDomains(domains))
                }
            }
        }
    }
}

fn host_within(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Parameters of one crawl run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Seed URL.
    pub start_url: String,
    /// Deepest link hop visited; pages at this depth are not expanded.
    pub max_depth: usize,
    /// Upper bound on visited URLs.
    pub max_pages: usize,
    /// Delay between requests to the same domain.
    pub request_delay: Duration,
    /// Honor robots.txt.
    pub respect_robots_txt: bool,
    /// Allow links to hosts outside the seed's domain.
    pub follow_external_links: bool,
    /// Host restriction.
    pub scope: DomainScope,
    /// When non-empty, a link must match one of these.
    pub include_patterns: Vec<String>,
    /// A link matching any of these is dropped.
    pub exclude_patterns: Vec<String>,
    /// Extensions classified as resources.
    pub downloadable_extensions: Vec<String>,
    /// Submit every found resource to the download manager.
    pub auto_download: bool,
    /// Destination for auto-downloaded resources.
    pub destination: Option<PathBuf>,
    /// Pages fetched concurrently.
    pub concurrency: usize,
}

impl CrawlConfig {
    /// Config with defaults from [`CrawlerSettings::default`].
    #[must_use]
    pub fn new(start_url: impl Into<String>) -> Self {
        Self::from_settings(start_url, &CrawlerSettings::default())
    }

    /// Config seeded from the crawler settings.
    #[must_use]
    pub fn from_settings(start_url: impl Into<String>, settings: &CrawlerSettings) -> Self {
        Self {
            start_url: start_url.into(),
            max_depth: settings.max_depth,
            max_pages: settings.max_pages,
            request_delay: Duration::from_millis(settings.request_delay_ms),
            respect_robots_txt: settings.respect_robots_txt,
            follow_external_links: settings.follow_external_links,
            scope: DomainScope::default(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            downloadable_extensions: settings.downloadable_extensions.clone(),
            auto_download: false,
            destination: None,
            concurrency: settings.concurrency,
        }
    }
}

/// Crawl bookkeeping, reset at every start.
#[derive(Debug, Default)]
struct Frontier {
    queue: VecDeque<(Url, usize)>,
    queued: HashSet<String>,
    visited: Vec<String>,
    downloadable: Vec<String>,
    in_flight: usize,
    downloads_queued: usize,
}

impl Frontier {
    fn seeded(seed: Url) -> Self {
        let mut frontier = Self::default();
        frontier.queued.insert(seed.as_str().to_string());
        frontier.queue.push_back((seed, 0));
        frontier
    }

    fn progress(&self) -> CrawlProgress {
        CrawlProgress {
            pages_visited: self.visited.len(),
            total_urls: self.queued.len(),
            resources_found: self.downloadable.len(),
            downloads_queued: self.downloads_queued,
        }
    }
}

fn lock(frontier: &Mutex<Frontier>) -> MutexGuard<'_, Frontier> {
    frontier.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Link filter compiled from a [`CrawlConfig`].
#[derive(Debug)]
struct LinkFilter {
    seed_host: String,
    scope: DomainScope,
    follow_external: bool,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl LinkFilter {
    fn new(config: &CrawlConfig, seed: &Url, events: &broadcast::Sender<CrawlEvent>) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "ignoring invalid crawl filter");
                        let _ = events.send(CrawlEvent::Error {
                            url: p.clone(),
                            message: format!("invalid filter pattern: {e}"),
                        });
                        None
                    }
                })
                .collect()
        };
        Self {
            seed_host: seed.host_str().unwrap_or_default().to_ascii_lowercase(),
            scope: config.scope.clone(),
            follow_external: config.follow_external_links,
            include: compile(&config.include_patterns),
            exclude: compile(&config.exclude_patterns),
        }
    }

    fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return false;
        };
        let external = !host_within(&host, &self.seed_host);
        let in_scope = match &self.scope {
            DomainScope::SameDomain => !external,
            DomainScope::SameHost => host == self.seed_host,
            DomainScope::SpecifiedDomains(domains) => domains
                .iter()
                .any(|d| host_within(&host, &d.to_ascii_lowercase())),
            DomainScope::FollowAll => !external || self.follow_external,
        };
        if !in_scope {
            return false;
        }
        let text = url.as_str();
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(text)) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(text))
    }
}

/// State shared by the workers of one run.
#[derive(Debug)]
struct CrawlRun {
    config: CrawlConfig,
    filter: LinkFilter,
    client: HttpClient,
    manager: Option<Arc<DownloadManager>>,
    robots: Arc<RobotsCache>,
    politeness: PolitenessDelay,
    frontier: Arc<Mutex<Frontier>>,
    wake: Notify,
    state: Arc<watch::Sender<CrawlState>>,
    events: broadcast::Sender<CrawlEvent>,
}

enum Next {
    Job(Url, usize),
    Wait,
    Done,
}

impl CrawlRun {
    fn emit(&self, event: CrawlEvent) {
        let _ = self.events.send(event);
    }

    fn emit_progress(&self) {
        let progress = lock(&self.frontier).progress();
        self.emit(CrawlEvent::Progress(progress));
    }

    async fn worker(self: Arc<Self>, cancel: CancellationToken) {
        let mut state_rx = self.state.subscribe();
        loop {
            let gate = async {
                state_rx
                    .wait_for(|s| *s != CrawlState::Paused)
                    .await
                    .map(|_| ())
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                r = gate => {
                    if r.is_err() {
                        return;
                    }
                }
            }

            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut frontier = lock(&self.frontier);
                if frontier.visited.len() >= self.config.max_pages {
                    Next::Done
                } else if let Some((url, depth)) = frontier.queue.pop_front() {
                    frontier.in_flight += 1;
                    Next::Job(url, depth)
                } else if frontier.in_flight == 0 {
                    Next::Done
                } else {
                    Next::Wait
                }
            };

            match next {
                Next::Done => {
                    self.wake.notify_waiters();
                    return;
                }
                Next::Wait => {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = notified => {}
                    }
                }
                Next::Job(url, depth) => {
                    self.visit(url, depth, &cancel).await;
                    lock(&self.frontier).in_flight -= 1;
                    self.wake.notify_waiters();
                }
            }
        }
    }

    #[instrument(skip(self, cancel), fields(url = %url, depth))]
    async fn visit(&self, url: Url, depth: usize, cancel: &CancellationToken) {
        if self.config.respect_robots_txt
            && self.robots.check(&url, &self.client).await == RobotsDecision::Disallowed
        {
            debug!("skipping disallowed url");
            return;
        }

        {
            let mut frontier = lock(&self.frontier);
            if frontier.visited.len() >= self.config.max_pages {
                return;
            }
            frontier.visited.push(url.as_str().to_string());
        }
        self.emit(CrawlEvent::PageVisited {
            url: url.as_str().to_string(),
            depth,
        });

        if is_downloadable(&url, &self.config.downloadable_extensions) {
            self.record_resource(&url, depth).await;
        } else if depth < self.config.max_depth {
            self.politeness.acquire(&url).await;
            let fetched = tokio::select! {
                () = cancel.cancelled() => return,
                r = self.client.fetch_text(&url) => r,
            };
            match fetched {
                Ok(page) if page.is_html() => {
                    let links = extract_links(&page.body, &page.final_url);
                    let mut frontier = lock(&self.frontier);
                    let before = frontier.queue.len();
                    for link in links {
                        if self.filter.allows(&link)
                            && frontier.queued.insert(link.as_str().to_string())
                        {
                            frontier.queue.push_back((link, depth + 1));
                        }
                    }
                    debug!(enqueued = frontier.queue.len() - before, "expanded page");
                }
                Ok(page) => {
                    debug!(content_type = ?page.content_type, "not html, not expanded");
                }
                Err(e) => {
                    warn!(error = %e, "page fetch failed");
                    self.emit(CrawlEvent::Error {
                        url: url.as_str().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        self.emit_progress();
    }

    async fn record_resource(&self, url: &Url, depth: usize) {
        lock(&self.frontier)
            .downloadable
            .push(url.as_str().to_string());
        self.emit(CrawlEvent::FileFound {
            url: url.as_str().to_string(),
            depth,
        });

        if !self.config.auto_download {
            return;
        }
        let Some(manager) = &self.manager else {
            return;
        };
        let mut request = DownloadRequest::new(url.as_str());
        if let Some(dir) = &self.config.destination {
            request = request.destination(dir.clone());
        }
        match manager.add_download(request).await {
            Ok(id) => {
                debug!(id = %id, "queued crawled resource");
                lock(&self.frontier).downloads_queued += 1;
            }
            Err(e) => {
                warn!(error = %e, "could not queue crawled resource");
                self.emit(CrawlEvent::Error {
                    url: url.as_str().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Handle to a running crawl.
#[derive(Debug)]
struct ActiveCrawl {
    cancel: CancellationToken,
    handle: JoinHandle<CrawlProgress>,
}

/// Breadth-first crawler with pause, resume and stop.
#[derive(Debug)]
pub struct WebsiteCrawler {
    client: HttpClient,
    manager: Option<Arc<DownloadManager>>,
    robots: Arc<RobotsCache>,
    frontier: Arc<Mutex<Frontier>>,
    state: Arc<watch::Sender<CrawlState>>,
    events: broadcast::Sender<CrawlEvent>,
    active: Mutex<Option<ActiveCrawl>>,
}

impl WebsiteCrawler {
    /// Crawler that only records resources.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            manager: None,
            robots: Arc::new(RobotsCache::new()),
            frontier: Arc::new(Mutex::new(Frontier::default())),
            state: Arc::new(watch::Sender::new(CrawlState::Idle)),
            events,
            active: Mutex::new(None),
        }
    }

    /// Crawler that can submit found resources to `manager` (see
    /// [`CrawlConfig::auto_download`]).
    #[must_use]
    pub fn with_manager(manager: Arc<DownloadManager>) -> Self {
        let mut crawler = Self::new(manager.http_client());
        crawler.manager = Some(manager);
        crawler
    }

    /// Starts a crawl in the background.
    ///
    /// Results of the previous run are discarded.
    ///
    /// # Errors
    ///
    /// - [`CrawlError::Url`] when the seed URL is invalid
    /// - [`CrawlError::AlreadyRunning`] while another crawl is running or paused
    #[instrument(skip(self, config), fields(url = %config.start_url))]
    pub fn start(&self, config: CrawlConfig) -> Result<(), CrawlError> {
        let seed = validate_url(&config.start_url)?;
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(self.state(), CrawlState::Running | CrawlState::Paused) {
            return Err(CrawlError::AlreadyRunning);
        }

        *lock(&self.frontier) = Frontier::seeded(seed.clone());
        let run = Arc::new(CrawlRun {
            filter: LinkFilter::new(&config, &seed, &self.events),
            politeness: PolitenessDelay::new(config.request_delay),
            config,
            client: self.client.clone(),
            manager: self.manager.clone(),
            robots: Arc::clone(&self.robots),
            frontier: Arc::clone(&self.frontier),
            wake: Notify::new(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        });
        let cancel = CancellationToken::new();
        self.state.send_replace(CrawlState::Running);
        info!(
            max_depth = run.config.max_depth,
            max_pages = run.config.max_pages,
            "crawl started"
        );
        let handle = tokio::spawn(drive(run, cancel.clone()));
        *active = Some(ActiveCrawl { cancel, handle });
        Ok(())
    }

    /// Parks the workers after their current page. Returns false unless running.
    pub fn pause(&self) -> bool {
        let paused = self.state.send_if_modified(|s| {
            if *s == CrawlState::Running {
                *s = CrawlState::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            info!("crawl paused");
        }
        paused
    }

    /// Continues a paused crawl. Returns false unless paused.
    pub fn resume(&self) -> bool {
        let resumed = self.state.send_if_modified(|s| {
            if *s == CrawlState::Paused {
                *s = CrawlState::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("crawl resumed");
        }
        resumed
    }

    /// Cancels the crawl and waits for its workers to exit.
    ///
    /// Visited URLs and found resources stay available.
    pub async fn stop(&self) -> Option<CrawlProgress> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        active.cancel.cancel();
        let progress = active.handle.await.ok();
        self.state.send_replace(CrawlState::Stopped);
        progress
    }

    /// Waits for the crawl to finish on its own.
    pub async fn wait(&self) -> Option<CrawlProgress> {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        active.handle.await.ok()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CrawlState {
        *self.state.borrow()
    }

    /// Whether a crawl is running or paused.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), CrawlState::Running | CrawlState::Paused)
    }

    /// URLs visited by the current or last run, in visit order.
    #[must_use]
    pub fn visited_urls(&self) -> Vec<String> {
        lock(&self.frontier).visited.clone()
    }

    /// Resources found by the current or last run.
    #[must_use]
    pub fn downloadable_files(&self) -> Vec<String> {
        lock(&self.frontier).downloadable.clone()
    }

    /// Current counters.
    #[must_use]
    pub fn progress(&self) -> CrawlProgress {
        lock(&self.frontier).progress()
    }

    /// Receiver for crawl events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.events.subscribe()
    }
}

async fn drive(run: Arc<CrawlRun>, cancel: CancellationToken) -> CrawlProgress {
    let mut workers = JoinSet::new();
    for _ in 0..run.config.concurrency.max(1) {
        workers.spawn(Arc::clone(&run).worker(cancel.clone()));
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "crawl worker panicked");
        }
    }

    let progress = lock(&run.frontier).progress();
    run.state.send_replace(CrawlState::Stopped);
    info!(
        pages = progress.pages_visited,
        resources = progress.resources_found,
        canceled = cancel.is_cancelled(),
        "crawl finished"
    );
    run.emit(CrawlEvent::Finished(progress));
    progress
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn filter(config: &CrawlConfig) -> LinkFilter {
        let (events, _) = broadcast::channel(4);
        LinkFilter::new(config, &url(&config.start_url), &events)
    }

    // ==================== DomainScope ====================

    #[test]
    fn test_scope_from_str() {
        assert_eq!("same-host".parse::<DomainScope>().unwrap(), DomainScope::SameHost);
        assert_eq!("all".parse::<DomainScope>().unwrap(), DomainScope::FollowAll);
        assert_eq!(
            "a.com, .b.org".parse::<DomainScope>().unwrap(),
            DomainScope::SpecifiedDomains(vec!["a.com".into(), "b.org".into()])
        );
        assert!("".parse::<DomainScope>().is_err());
    }

    #[test]
    fn test_host_within() {
        assert!(host_within("example.com", "example.com"));
        assert!(host_within("cdn.example.com", "example.com"));
        assert!(!host_within("badexample.com", "example.com"));
    }

    // ==================== LinkFilter ====================

    #[test]
    fn test_same_domain_accepts_subdomains() {
        let f = filter(&CrawlConfig::new("https://example.com/"));
        assert!(f.allows(&url("https://docs.example.com/a")));
        assert!(!f.allows(&url("https://other.com/a")));
    }

    #[test]
    fn test_same_host_is_exact() {
        let mut config = CrawlConfig::new("https://example.com/");
        config.scope = DomainScope::SameHost;
        let f = filter(&config);
        assert!(f.allows(&url("https://example.com/a")));
        assert!(!f.allows(&url("https://docs.example.com/a")));
    }

    #[test]
    fn test_follow_all_needs_external_flag() {
        let mut config = CrawlConfig::new("https://example.com/");
        config.scope = DomainScope::FollowAll;
        assert!(!filter(&config).allows(&url("https://other.com/")));
        config.follow_external_links = true;
        assert!(filter(&config).allows(&url("https://other.com/")));
    }

    #[test]
    fn test_specified_domains() {
        let mut config = CrawlConfig::new("https://example.com/");
        config.scope = DomainScope::SpecifiedDomains(vec!["mirror.org".into()]);
        let f = filter(&config);
        assert!(f.allows(&url("https://dl.mirror.org/x")));
        assert!(!f.allows(&url("https://example.com/x")));
    }

    #[test]
    fn test_include_exclude_filters() {
        let mut config = CrawlConfig::new("https://example.com/");
        config.include_patterns = vec!["/docs/".into()];
        config.exclude_patterns = vec![r"\.tmp$".into(), "([invalid".into()];
        let f = filter(&config);
        assert!(f.allows(&url("https://example.com/docs/a.html")));
        assert!(!f.allows(&url("https://example.com/blog/a.html")));
        assert!(!f.allows(&url("https://example.com/docs/a.tmp")));
        assert_eq!(f.exclude.len(), 1);
    }

    // ==================== WebsiteCrawler ====================

    #[test]
    fn test_new_crawler_is_idle() {
        let crawler = WebsiteCrawler::new(HttpClient::new());
        assert_eq!(crawler.state(), CrawlState::Idle);
        assert!(!crawler.pause());
        assert!(!crawler.resume());
        assert!(crawler.visited_urls().is_empty());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_seed() {
        let crawler = WebsiteCrawler::new(HttpClient::new());
        let err = crawler.start(CrawlConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, CrawlError::Url(_)));
        assert_eq!(crawler.state(), CrawlState::Idle);
    }

    #[tokio::test]
    async fn test_downloadable_seed_is_recorded_without_fetch() {
        let crawler = WebsiteCrawler::new(HttpClient::new());
        let mut config = CrawlConfig::new("http://127.0.0.1:9/file.zip");
        config.respect_robots_txt = false;
        crawler.start(config).unwrap();
        let progress = crawler.wait().await.unwrap();
        assert_eq!(progress.pages_visited, 1);
        assert_eq!(progress.resources_found, 1);
        assert_eq!(crawler.downloadable_files(), vec!["http://127.0.0.1:9/file.zip"]);
        assert_eq!(crawler.state(), CrawlState::Stopped);
    }

    #[tokio::test]
    async fn test_zero_page_limit_visits_nothing() {
        let crawler = WebsiteCrawler::new(HttpClient::new());
        let mut config = CrawlConfig::new("http://127.0.0.1:9/");
        config.max_pages = 0;
        crawler.start(config).unwrap();
        let progress = crawler.wait().await.unwrap();
        assert_eq!(progress.pages_visited, 0);
    }
}
