//! The Task record and its lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CoreError, TaskId, TaskStatus, TaskType};

/// Named task inputs, as a JSON object.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// A Task represents one unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Task type to execute.
    pub name: TaskType,

    /// Validated input parameters.
    pub parameters: Parameters,

    /// Current task status.
    pub status: TaskStatus,

    /// Handler output, set only when completed.
    pub output: Option<serde_json::Value>,

    /// Failure detail, set only when failed.
    pub error: Option<TaskError>,

    /// Number of times a worker claimed this task for execution.
    pub attempts: u32,

    /// When the task was submitted.
    pub created_at: DateTime<Utc>,

    /// When the task last changed state.
    pub updated_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(name: TaskType, parameters: Parameters) -> Self {
        Self {
            id: TaskId::generate(),
            name,
            parameters,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            updated_at: None,
            completed_at: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move a pending task to running.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        self.attempts += 1;
        Ok(())
    }

    /// Record another execution attempt of an already running task.
    ///
    /// Used when a retry or a crash takeover re-claims the task.
    pub fn resume(&mut self) -> Result<(), CoreError> {
        if self.status != TaskStatus::Running {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to: TaskStatus::Running,
            });
        }
        self.attempts += 1;
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task as completed with the handler's output.
    pub fn complete(&mut self, output: serde_json::Value) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed)?;
        self.output = Some(output);
        self.completed_at = self.updated_at;
        Ok(())
    }

    /// Mark the task as failed.
    pub fn fail(&mut self, error: TaskError) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = self.updated_at;
        Ok(())
    }

    /// Check the record-level invariants tying status to the optional fields.
    pub fn is_consistent(&self) -> bool {
        let terminal = self.status.is_terminal();
        let completed = self.status == TaskStatus::Completed;
        let failed = self.status == TaskStatus::Failed;

        self.completed_at.is_some() == terminal
            && self.output.is_some() == completed
            && self.error.is_some() == failed
            && self.completed_at.map_or(true, |at| at >= self.created_at)
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Some(Utc::now());
        Ok(())
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure class.
    pub kind: ErrorKind,

    /// Human-readable message.
    pub message: String,
}

impl TaskError {
    /// Create a new TaskError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Failure class recorded on a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler rejected its input while executing.
    InvalidInput,
    /// Non-retryable execution failure.
    Permanent,
    /// A transient failure outlasted the retry budget.
    TransientExhausted,
}

impl ErrorKind {
    /// Snake-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Permanent => "permanent",
            Self::TransientExhausted => "transient_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
