//! Typed, validated settings.
//!
//! Settings are grouped per category and loaded from a TOML file. Every field
//! has a default, so a partial file (or none at all) is valid. Values are
//! range-checked once by [`Settings::validate`] at load time and again on every
//! [`Settings::set`], so consumers never see an out-of-range value.
//!
//! ```toml
//! [general]
//! download_directory = "/home/me/Downloads"
//! max_concurrent_downloads = 3
//! segment_count = 4
//!
//! [connection]
//! max_retries = 3
//! retry_delay_ms = 1000
//! backoff = "exponential"
//!
//! [bandwidth]
//! global_speed_limit = 0
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors produced while loading, validating or editing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for [`Settings`].
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// Settings could not be serialized.
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The settings file could not be written.
    #[error("failed to write config file '{path}': {source}")]
    Write {
        /// File that was being written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A value is outside its allowed range.
    #[error("invalid value for `{key}`: {message}")]
    Invalid {
        /// Dotted settings key.
        key: &'static str,
        /// What is wrong with the value.
        message: String,
    },

    /// The dotted key does not name a setting.
    #[error("unknown setting `{0}`")]
    UnknownKey(String),

    /// The value could not be parsed into the setting's type.
    #[error("cannot parse `{value}` for `{key}`")]
    BadValue {
        /// Dotted settings key.
        key: String,
        /// The raw value.
        value: String,
    },
}

/// Backoff shape between segment retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles per attempt, capped at `max_retry_delay_ms`.
    #[default]
    Exponential,
}

impl Backoff {
    /// Returns the configuration spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown backoff: {other}")),
        }
    }
}

/// Where downloads go and how many run at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Default destination directory.
    pub download_directory: PathBuf,
    /// Maximum tasks in Connecting/Downloading at once.
    pub max_concurrent_downloads: usize,
    /// Default segment count for resumable downloads.
    pub segment_count: usize,
    /// JSON task store; `None` disables persistence.
    pub state_file: Option<PathBuf>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            download_directory: PathBuf::from("downloads"),
            max_concurrent_downloads: 3,
            segment_count: 4,
            state_file: None,
        }
    }
}

/// HTTP client and retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout_secs: u64,
    /// Idle read timeout for a response body.
    pub read_timeout_secs: u64,
    /// Retries per segment after the first attempt.
    pub max_retries: u32,
    /// Base delay between retries.
    pub retry_delay_ms: u64,
    /// Upper bound for exponential backoff.
    pub max_retry_delay_ms: u64,
    /// Fixed or exponential backoff.
    pub backoff: Backoff,
    /// Overrides the default User-Agent.
    pub user_agent: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 32_000,
            backoff: Backoff::Exponential,
            user_agent: None,
        }
    }
}

/// Global bandwidth limit shared by every task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthSettings {
    /// Bytes per second across all downloads (0 = unlimited).
    pub global_speed_limit: u64,
    /// Token-bucket burst (0 = one second of `global_speed_limit`).
    pub burst_size: u64,
}

/// Batch dispatcher limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Batch items active at once, independent of the queue limit.
    pub max_concurrent: usize,
    /// Stop dispatching after this many items (0 = no cap).
    pub max_total_downloads: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_total_downloads: 0,
        }
    }
}

/// Defaults applied to new crawls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Link hops from the seed page.
    pub max_depth: usize,
    /// Upper bound on visited URLs per run.
    pub max_pages: usize,
    /// Delay between requests to the same domain.
    pub request_delay_ms: u64,
    /// Honor robots.txt disallow rules.
    pub respect_robots_txt: bool,
    /// Allow traversal to other hosts.
    pub follow_external_links: bool,
    /// Pages fetched concurrently.
    pub concurrency: usize,
    /// Extensions (without dot) classified as downloadable resources.
    pub downloadable_extensions: Vec<String>,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_pages: 100,
            request_delay_ms: 500,
            respect_robots_txt: true,
            follow_external_links: false,
            concurrency: 1,
            downloadable_extensions: [
                "zip", "rar", "7z", "tar", "gz", "bz2", "xz", "iso", "exe", "msi", "dmg", "deb",
                "rpm", "apk", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "epub", "mp3",
                "flac", "wav", "ogg", "mp4", "mkv", "avi", "mov", "webm", "jpg", "jpeg", "png",
                "gif", "webp", "svg",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

/// All settings, one struct per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Destination and concurrency.
    pub general: GeneralSettings,
    /// HTTP client and retries.
    pub connection: ConnectionSettings,
    /// Global speed limit.
    pub bandwidth: BandwidthSettings,
    /// Batch dispatcher.
    pub batch: BatchSettings,
    /// Crawler defaults.
    pub crawler: CrawlerSettings,
}

/// Dotted keys accepted by [`Settings::get`] and [`Settings::set`].
pub const SETTING_KEYS: &[&str] = &[
    "general.download_directory",
    "general.max_concurrent_downloads",
    "general.segment_count",
    "general.state_file",
    "connection.connect_timeout_secs",
    "connection.read_timeout_secs",
    "connection.max_retries",
    "connection.retry_delay_ms",
    "connection.max_retry_delay_ms",
    "connection.backoff",
    "connection.user_agent",
    "bandwidth.global_speed_limit",
    "bandwidth.burst_size",
    "batch.max_concurrent",
    "batch.max_total_downloads",
    "crawler.max_depth",
    "crawler.max_pages",
    "crawler.request_delay_ms",
    "crawler.respect_robots_txt",
    "crawler.follow_external_links",
    "crawler.concurrency",
];

fn check_range(
    key: &'static str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key,
            message: format!(
                "{value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn optional_string(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

impl Settings {
    /// Loads settings from a TOML file and validates them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or holds an
    /// out-of-range value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Loads `path` if it exists, otherwise returns validated defaults.
    ///
    /// # Errors
    ///
    /// Same as [`Settings::load`] when the file exists.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Writes the settings as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, raw).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Range-checks every value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.general;
        check_range(
            "general.max_concurrent_downloads",
            g.max_concurrent_downloads as u64,
            1..=32,
        )?;
        check_range("general.segment_count", g.segment_count as u64, 1..=32)?;
        if g.download_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "general.download_directory",
                message: "must not be empty".to_string(),
            });
        }

        let c = &self.connection;
        check_range("connection.connect_timeout_secs", c.connect_timeout_secs, 1..=600)?;
        check_range("connection.read_timeout_secs", c.read_timeout_secs, 1..=3600)?;
        check_range("connection.max_retries", u64::from(c.max_retries), 0..=20)?;
        check_range("connection.retry_delay_ms", c.retry_delay_ms, 0..=600_000)?;
        check_range("connection.max_retry_delay_ms", c.max_retry_delay_ms, 0..=3_600_000)?;

        let b = &self.batch;
        check_range("batch.max_concurrent", b.max_concurrent as u64, 1..=32)?;

        let cr = &self.crawler;
        check_range("crawler.max_depth", cr.max_depth as u64, 0..=64)?;
        check_range("crawler.max_pages", cr.max_pages as u64, 1..=1_000_000)?;
        check_range("crawler.request_delay_ms", cr.request_delay_ms, 0..=60_000)?;
        check_range("crawler.concurrency", cr.concurrency as u64, 1..=16)?;
        Ok(())
    }

    /// Returns the maximum number of concurrently transferring tasks.
    #[must_use]
    pub fn get_max_concurrent_downloads(&self) -> usize {
        self.general.max_concurrent_downloads
    }

    /// Returns the default segment count.
    #[must_use]
    pub fn get_segment_count(&self) -> usize {
        self.general.segment_count
    }

    /// Returns the default destination directory.
    #[must_use]
    pub fn get_download_directory(&self) -> &Path {
        &self.general.download_directory
    }

    /// Returns the global speed limit in bytes per second (0 = unlimited).
    #[must_use]
    pub fn get_global_speed_limit(&self) -> u64 {
        self.bandwidth.global_speed_limit
    }

    /// Reads a setting by dotted key, formatted for display.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownKey`] for keys not in [`SETTING_KEYS`].
    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "general.download_directory" => self.general.download_directory.display().to_string(),
            "general.max_concurrent_downloads" => self.general.max_concurrent_downloads.to_string(),
            "general.segment_count" => self.general.segment_count.to_string(),
            "general.state_file" => self
                .general
                .state_file
                .as_ref()
                .map_or_else(|| "none".to_string(), |p| p.display().to_string()),
            "connection.connect_timeout_secs" => self.connection.connect_timeout_secs.to_string(),
            "connection.read_timeout_secs" => self.connection.read_timeout_secs.to_string(),
            "connection.max_retries" => self.connection.max_retries.to_string(),
            "connection.retry_delay_ms" => self.connection.retry_delay_ms.to_string(),
            "connection.max_retry_delay_ms" => self.connection.max_retry_delay_ms.to_string(),
            "connection.backoff" => self.connection.backoff.to_string(),
            "connection.user_agent" => self
                .connection
                .user_agent
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            "bandwidth.global_speed_limit" => self.bandwidth.global_speed_limit.to_string(),
            "bandwidth.burst_size" => self.bandwidth.burst_size.to_string(),
            "batch.max_concurrent" => self.batch.max_concurrent.to_string(),
            "batch.max_total_downloads" => self.batch.max_total_downloads.to_string(),
            "crawler.max_depth" => self.crawler.max_depth.to_string(),
            "crawler.max_pages" => self.crawler.max_pages.to_string(),
            "crawler.request_delay_ms" => self.crawler.request_delay_ms.to_string(),
            "crawler.respect_robots_txt" => self.crawler.respect_robots_txt.to_string(),
            "crawler.follow_external_links" => self.crawler.follow_external_links.to_string(),
            "crawler.concurrency" => self.crawler.concurrency.to_string(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// Sets a setting by dotted key. The change is validated and rolled back
    /// if it puts the settings out of range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unknown keys, unparseable values or
    /// out-of-range results.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut next = self.clone();
        match key {
            "general.download_directory" => {
                next.general.download_directory = PathBuf::from(value.trim());
            }
            "general.max_concurrent_downloads" => {
                next.general.max_concurrent_downloads = parse_value(key, value)?;
            }
            "general.segment_count" => next.general.segment_count = parse_value(key, value)?,
            "general.state_file" => {
                next.general.state_file = optional_string(value).map(PathBuf::from);
            }
            "connection.connect_timeout_secs" => {
                next.connection.connect_timeout_secs = parse_value(key, value)?;
            }
            "connection.read_timeout_secs" => {
                next.connection.read_timeout_secs = parse_value(key, value)?;
            }
            "connection.max_retries" => next.connection.max_retries = parse_value(key, value)?,
            "connection.retry_delay_ms" => {
                next.connection.retry_delay_ms = parse_value(key, value)?;
            }
            "connection.max_retry_delay_ms" => {
                next.connection.max_retry_delay_ms = parse_value(key, value)?;
            }
            "connection.backoff" => next.connection.backoff = parse_value(key, value)?,
            "connection.user_agent" => next.connection.user_agent = optional_string(value),
            "bandwidth.global_speed_limit" => {
                next.bandwidth.global_speed_limit = parse_value(key, value)?;
            }
            "bandwidth.burst_size" => next.bandwidth.burst_size = parse_value(key, value)?,
            "batch.max_concurrent" => next.batch.max_concurrent = parse_value(key, value)?,
            "batch.max_total_downloads" => {
                next.batch.max_total_downloads = parse_value(key, value)?;
            }
            "crawler.max_depth" => next.crawler.max_depth = parse_value(key, value)?,
            "crawler.max_pages" => next.crawler.max_pages = parse_value(key, value)?,
            "crawler.request_delay_ms" => next.crawler.request_delay_ms = parse_value(key, value)?,
            "crawler.respect_robots_txt" => {
                next.crawler.respect_robots_txt = parse_value(key, value)?;
            }
            "crawler.follow_external_links" => {
                next.crawler.follow_external_links = parse_value(key, value)?;
            }
            "crawler.concurrency" => next.crawler.concurrency = parse_value(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// Resolves the default settings file location.
///
/// Resolution order:
/// 1. `$XDG_CONFIG_HOME/dlm/config.toml`
/// 2. `$HOME/.config/dlm/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("dlm").join("config.toml"));
    }
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(|home| PathBuf::from(home).join(".config").join("dlm").join("config.toml"))
}
