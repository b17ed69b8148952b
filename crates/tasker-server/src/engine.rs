//! Submission and query engine.
//!
//! The synchronous half of the system: accept a task, persist it, hand it to
//! the dispatch router, and answer status/output queries through the result
//! cache with the task store as fallback.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use tasker_core::{CoreError, Parameters, Task, TaskId, TaskStatus};

use crate::broker::BrokerError;
use crate::registry::{RegistryError, ValidationError};
use crate::state::AppState;
use crate::store::StoreError;

/// Errors surfaced to submit/query callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown task: {0}")]
    UnknownTaskType(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid task UUID: {0}")]
    InvalidTaskId(String),

    #[error("Service unavailable: {0}")]
    Infrastructure(String),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownTaskType(name) => Self::UnknownTaskType(name),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Infrastructure(other.to_string()),
        }
    }
}

impl From<BrokerError> for EngineError {
    fn from(e: BrokerError) -> Self {
        Self::Infrastructure(e.to_string())
    }
}

impl From<CoreError> for EngineError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidTaskId(raw) => Self::InvalidTaskId(raw),
            CoreError::UnknownTaskType(name) => Self::UnknownTaskType(name),
            other => Self::Infrastructure(other.to_string()),
        }
    }
}

/// Submission and query operations over the shared state.
pub struct TaskEngine {
    state: Arc<AppState>,
}

impl TaskEngine {
    /// Create a new TaskEngine.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Validate, persist and dispatch a task. Returns without waiting for
    /// execution.
    pub async fn submit(&self, name: &str, parameters: Parameters) -> Result<TaskId, EngineError> {
        let (task_type, handler) = self.state.registry.resolve(name)?;
        handler.validate(&parameters)?;

        let task = Task::new(task_type, parameters);
        let task_id = task.id;
        self.state.store.create(task.clone()).await?;

        if let Err(e) = self.state.router.dispatch(&task).await {
            warn!(
                task_id = %task_id,
                task_name = %task_type,
                error = %e,
                "Task persisted but dispatch failed"
            );
            return Err(e.into());
        }

        self.state.metrics.record_submission(task_type);
        info!(task_id = %task_id, task_name = %task_type, "Task submitted");
        Ok(task_id)
    }

    /// Current status of a task.
    pub async fn get_status(&self, id: &TaskId) -> Result<TaskStatus, EngineError> {
        Ok(self.lookup(id).await?.status)
    }

    /// Full task record, including output or error once terminal.
    pub async fn get_output(&self, id: &TaskId) -> Result<Task, EngineError> {
        self.lookup(id).await
    }

    async fn lookup(&self, id: &TaskId) -> Result<Task, EngineError> {
        if let Some(task) = self.state.cache.get(id).await {
            return Ok(task);
        }

        let task = self
            .state
            .store
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(*id))?;

        if task.is_terminal() {
            self.state.cache.put(&task).await;
        }
        Ok(task)
    }
}
