//! robots.txt fetching, parsing and matching.
//!
//! Rules are cached per origin for 24h. Only the groups addressed to `*` or
//! to our own agent token are honored.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::download::{DownloadError, HttpClient};
use crate::user_agent::CRAWLER_AGENT_TOKEN;

const ROBOTS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Result of checking a URL against robots.txt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsDecision {
    /// URL is allowed.
    Allowed,
    /// URL is disallowed by robots.txt.
    Disallowed,
}

/// One `Disallow:` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DisallowRule {
    /// `/private` blocks every path starting with it.
    Prefix(String),
    /// `/tmp*` blocks every path starting with `/tmp`.
    Wildcard(String),
    /// `/index.html$` blocks exactly that path.
    Exact(String),
}

impl DisallowRule {
    fn parse(path: &str) -> Option<Self> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let path = if path.starts_with('/') || path.starts_with('*') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Some(if let Some(exact) = path.strip_suffix('$') {
            Self::Exact(exact.to_string())
        } else if let Some(prefix) = path.strip_suffix('*') {
            Self::Wildcard(prefix.to_string())
        } else {
            Self::Prefix(path)
        })
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(p) | Self::Wildcard(p) => path.starts_with(p.as_str()),
            Self::Exact(p) => path == p,
        }
    }
}

/// Disallow rules for one origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RobotsRules {
    disallow: Vec<DisallowRule>,
}

impl RobotsRules {
    /// Parses a robots.txt body for `agent`.
    pub(crate) fn parse(body: &str, agent: &str) -> Self {
        let agent = agent.to_ascii_lowercase();
        let mut applies = false;
        // Consecutive User-agent lines form one group.
        let mut in_agent_lines = false;
        let mut disallow = Vec::new();

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            if field == "user-agent" {
                let value = value.to_ascii_lowercase();
                let matches = value == "*" || value == agent;
                applies = if in_agent_lines { applies || matches } else { matches };
                in_agent_lines = true;
                continue;
            }
            in_agent_lines = false;

            if applies
                && field == "disallow"
                && let Some(rule) = DisallowRule::parse(value)
                && !disallow.contains(&rule)
            {
                disallow.push(rule);
            }
        }
        Self { disallow }
    }

    /// Returns true when `path` (with query) is allowed.
    pub(crate) fn is_allowed(&self, path: &str) -> bool {
        !self.disallow.iter().any(|rule| rule.matches(path))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.disallow.len()
    }
}

#[derive(Debug)]
struct CachedRobots {
    rules: RobotsRules,
    fetched_at: Instant,
}

/// robots.txt checker with a per-origin cache.
#[derive(Debug, Default)]
pub struct RobotsCache {
    cache: DashMap<String, CachedRobots>,
}

impl RobotsCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Checks `url` against its origin's robots.txt, fetching it when the
    /// cache is empty or stale.
    ///
    /// A missing or unreachable robots.txt allows everything.
    #[instrument(skip(self, client), fields(url = %url))]
    pub async fn check(&self, url: &Url, client: &HttpClient) -> RobotsDecision {
        let Some(origin) = origin_for_robots(url) else {
            return RobotsDecision::Allowed;
        };

        let fresh = self
            .cache
            .get(&origin)
            .is_some_and(|c| c.fetched_at.elapsed() <= ROBOTS_TTL);
        if !fresh {
            let rules = match fetch_robots_txt(&origin, client).await {
                Ok(body) => RobotsRules::parse(&body, CRAWLER_AGENT_TOKEN),
                Err(e) => {
                    warn!(origin = %origin, error = %e, "robots.txt unavailable, allowing all");
                    RobotsRules::default()
                }
            };
            self.cache.insert(
                origin.clone(),
                CachedRobots {
                    rules,
                    fetched_at: Instant::now(),
                },
            );
        }

        let path = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        let allowed = self
            .cache
            .get(&origin)
            .is_none_or(|entry| entry.rules.is_allowed(&path));
        if allowed {
            RobotsDecision::Allowed
        } else {
            debug!(path = %path, origin = %origin, "robots.txt disallows path");
            RobotsDecision::Disallowed
        }
    }
}

async fn fetch_robots_txt(origin: &str, client: &HttpClient) -> Result<String, DownloadError> {
    let robots_url = format!("{origin}/robots.txt");
    let parsed = Url::parse(&robots_url).map_err(|_| DownloadError::invalid_url(&robots_url))?;
    match client.fetch_text(&parsed).await {
        Ok(page) => Ok(page.body),
        Err(DownloadError::HttpStatus { status: 404 | 410, .. }) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Builds the origin string (scheme, host and port) used as the cache key.
#[must_use]
pub fn origin_for_robots(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(p) => format!("{}://{host}:{p}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}
