//! Task submission and query handlers.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use tasker_core::TaskId;

use crate::engine::{EngineError, TaskEngine};
use crate::http::responses::{
    invalid_body, RunTaskRequest, RunTaskResponse, TaskOutputResponse, TaskStatusResponse,
    TaskUuidQuery,
};
use crate::state::AppState;

/// Submit a task for asynchronous execution.
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    json_result: Result<Json<RunTaskRequest>, JsonRejection>,
) -> Response {
    let req = match json_result {
        Ok(Json(req)) => req,
        Err(rejection) => {
            warn!(error = %rejection, "Invalid JSON in request body");
            return invalid_body(rejection);
        }
    };

    match TaskEngine::new(state)
        .submit(&req.task_name, req.task_parameters)
        .await
    {
        Ok(task_uuid) => (
            StatusCode::CREATED,
            Json(RunTaskResponse {
                task_uuid,
                message: "Task submitted successfully".to_string(),
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Full task record, including output or error once terminal.
pub async fn get_task_output(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TaskUuidQuery>,
) -> Result<Json<TaskOutputResponse>, EngineError> {
    let id: TaskId = query.task_uuid.parse()?;
    let task = TaskEngine::new(state).get_output(&id).await?;
    Ok(Json(task.into()))
}

/// Current status only.
pub async fn get_task_status(
    State(state): State<Arc<AppState>>,
    Path(task_uuid): Path<String>,
) -> Result<Json<TaskStatusResponse>, EngineError> {
    let id: TaskId = task_uuid.parse()?;
    let status = TaskEngine::new(state).get_status(&id).await?;
    Ok(Json(TaskStatusResponse {
        task_uuid: id,
        status,
    }))
}
