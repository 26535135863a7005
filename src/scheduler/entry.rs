//! Schedule entries and recurrence arithmetic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::download::TaskId;
use crate::manager::DownloadRequest;

/// Identifier of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(u64);

impl ScheduleId {
    /// Wraps a raw id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScheduleId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(Self)
    }
}

/// How an entry repeats after firing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    /// Fires once, then the entry is removed.
    #[default]
    Once,
    /// Every 3600 seconds.
    Hourly,
    /// Every 86400 seconds.
    Daily,
    /// Every 604800 seconds.
    Weekly,
    /// Same day next calendar month, clamped to the month's last day.
    Monthly,
    /// Every N seconds.
    Custom(u64),
}

impl Recurrence {
    /// Next start time after a run scheduled at `previous`.
    ///
    /// Advances from the previous start time, not from the time the entry
    /// actually fired. `None` for one-time entries.
    #[must_use]
    pub fn next_after(&self, previous: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let seconds = match self {
            Self::Once => return None,
            Self::Monthly => return previous.checked_add_months(Months::new(1)),
            Self::Hourly => 3_600,
            Self::Daily => 86_400,
            Self::Weekly => 604_800,
            Self::Custom(secs) => i64::try_from(*secs).ok()?,
        };
        previous.checked_add_signed(TimeDelta::try_seconds(seconds)?)
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Once => f.write_str("once"),
            Self::Hourly => f.write_str("hourly"),
            Self::Daily => f.write_str("daily"),
            Self::Weekly => f.write_str("weekly"),
            Self::Monthly => f.write_str("monthly"),
            Self::Custom(secs) => write!(f, "every {secs}s"),
        }
    }
}

impl FromStr for Recurrence {
    type Err = String;

    /// Accepts `once`, `hourly`, `daily`, `weekly`, `monthly`, or a number
    /// of seconds (`90`, `90s`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "once" | "none" => Ok(Self::Once),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => other
                .trim_start_matches("every")
                .trim()
                .trim_end_matches('s')
                .parse::<u64>()
                .map(Self::Custom)
                .map_err(|_| format!("invalid recurrence '{other}'")),
        }
    }
}

/// What a due entry does to its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleAction {
    /// Start (or restart) the download.
    #[default]
    Start,
    /// Pause the download.
    Pause,
    /// Resume the download.
    Resume,
}

impl ScheduleAction {
    /// Lowercase action name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            other => Err(format!("invalid action '{other}'")),
        }
    }
}

/// What an entry acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTarget {
    /// An existing task.
    Task {
        /// Bound task.
        id: TaskId,
    },
    /// A download created when the entry fires.
    NewDownload {
        /// Submission used every time the entry fires.
        request: DownloadRequest,
    },
}

/// One scheduled action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Entry id.
    pub id: ScheduleId,
    /// Task or submission.
    pub target: ScheduleTarget,
    /// Action on the target.
    pub action: ScheduleAction,
    /// Next time the entry fires.
    pub start_time: DateTime<Utc>,
    /// Repetition.
    pub recurrence: Recurrence,
    /// Inactive entries are kept but never fire.
    pub active: bool,
    /// When the entry last fired.
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// Whether the entry should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.start_time <= now
    }
}
