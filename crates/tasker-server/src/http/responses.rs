//! HTTP request and response types.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use tasker_core::{ErrorKind, Parameters, Task, TaskId, TaskStatus, TaskType};

use crate::engine::EngineError;

// ============================================================================
// Submission types
// ============================================================================

/// Request body for `POST /run-task`.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunTaskRequest {
    /// Registered task type name.
    pub task_name: String,

    /// Handler parameters.
    #[serde(default)]
    pub task_parameters: Parameters,
}

/// Response body for `POST /run-task`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub task_uuid: TaskId,
    pub message: String,
}

// ============================================================================
// Query types
// ============================================================================

/// Query string for `GET /get-task-output`.
#[derive(Debug, Deserialize)]
pub struct TaskUuidQuery {
    pub task_uuid: String,
}

/// Response body for `GET /get-task-output`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskOutputResponse {
    pub task_uuid: TaskId,
    pub task_name: TaskType,
    pub status: TaskStatus,
    pub task_output: Option<Value>,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskOutputResponse {
    fn from(task: Task) -> Self {
        let (error_message, error_kind) = match task.error {
            Some(error) => (Some(error.message), Some(error.kind)),
            None => (None, None),
        };
        Self {
            task_uuid: task.id,
            task_name: task.name,
            status: task.status,
            task_output: task.output,
            error_message,
            error_kind,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

/// Response body for `GET /tasks/{task_uuid}/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_uuid: TaskId,
    pub status: TaskStatus,
}

// ============================================================================
// Health types
// ============================================================================

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub error_code: String,
}

/// Error body for a request whose JSON could not be read, keeping the
/// rejection's status (400 syntax, 415 content type, 422 shape).
pub fn invalid_body(rejection: JsonRejection) -> Response {
    (
        rejection.status(),
        Json(ErrorResponse {
            detail: rejection.body_text(),
            error_code: "invalid_request".to_string(),
        }),
    )
        .into_response()
}

impl EngineError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::UnknownTaskType(_) => (StatusCode::UNPROCESSABLE_ENTITY, "unknown_task_type"),
            Self::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::InvalidTaskId(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_task_uuid"),
            Self::Infrastructure(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                detail: self.to_string(),
                error_code: code.to_string(),
            }),
        )
            .into_response()
    }
}
