//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for Tasker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Task type name is not one of the registered types.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Task identifier is not a well-formed UUID.
    #[error("Invalid task id '{0}'")]
    InvalidTaskId(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },
}
