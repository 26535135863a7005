//! Shared User-Agent strings for download and crawler HTTP traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/dlm";

/// Product token matched against `User-agent:` groups in robots.txt.
pub(crate) const CRAWLER_AGENT_TOKEN: &str = "dlm";

/// Default User-Agent for download and crawl requests.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{CRAWLER_AGENT_TOKEN}/{version} (+{PROJECT_UA_URL})")
}
