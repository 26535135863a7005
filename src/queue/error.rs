//! Error types for queue operations.

use thiserror::Error;

use crate::download::{TaskError, TaskId};

/// Errors from registry lookups and task state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// No task with this id is registered.
    #[error("no download with id {0}")]
    NotFound(TaskId),

    /// The task rejected the state change.
    #[error(transparent)]
    Task(#[from] TaskError),
}
