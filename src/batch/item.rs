//! Batch item and its status.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::download::TaskId;

/// Where a batch item is in its run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    /// Not yet handed to the manager.
    #[default]
    Pending,
    /// Submitted; waiting for the task to finish.
    Active,
    /// The task completed.
    Completed,
    /// Submission was rejected or the task ended without completing.
    Failed,
}

impl BatchItemStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed or failed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for BatchItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One URL of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    /// Validated URL.
    pub url: String,
    /// Directory override; the manager default otherwise.
    pub destination: Option<PathBuf>,
    /// Filename override.
    pub filename: Option<String>,
    /// Run status.
    pub status: BatchItemStatus,
    /// Task created for this item.
    pub task_id: Option<TaskId>,
    /// Why the item failed.
    pub error: Option<String>,
}

impl BatchItem {
    /// Pending item for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            filename: None,
            status: BatchItemStatus::Pending,
            task_id: None,
            error: None,
        }
    }

    /// Sets the filename override.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Sets the destination override.
    #[must_use]
    pub fn with_destination(mut self, dir: impl Into<PathBuf>) -> Self {
        self.destination = Some(dir.into());
        self
    }
}
