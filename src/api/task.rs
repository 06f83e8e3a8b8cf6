//! Task lifecycle endpoints: create, patch, delete.

use axum::extract::{OriginalUri, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::models::task::Task;
use crate::domain::ports::driver::{Plan, TaskPatch};

use super::{run_option_from_query, ApiError, ApiState, RequestId};

#[derive(Serialize)]
pub struct TaskResponse {
    pub request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
}

/// `POST /v1/tasks[?run=now|inspect]`
pub async fn create_task(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
    Json(task): Json<Task>,
) -> Response {
    let run = match run_option_from_query(uri.query()) {
        Ok(run) => run,
        Err(message) => {
            return ApiError::new(request_id, StatusCode::BAD_REQUEST, message).into_response()
        }
    };

    match state.controller.create_task(task, run).await {
        Ok(plan) => (
            StatusCode::CREATED,
            Json(TaskResponse {
                request_id: request_id.0,
                plan,
            }),
        )
            .into_response(),
        Err(err) => ApiError::from_domain(request_id, err).into_response(),
    }
}

/// Decode a PATCH body, rejecting keys other than `enabled`.
fn decode_patch(body: &serde_json::Value) -> Result<Option<bool>, String> {
    let object = body
        .as_object()
        .ok_or_else(|| "request body must be a JSON object".to_string())?;
    let mut unused: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|k| *k != "enabled")
        .collect();
    if !unused.is_empty() {
        unused.sort_unstable();
        return Err(format!(
            "request body's JSON contains unsupported keys: {}",
            unused.join(", ")
        ));
    }
    match object.get("enabled") {
        None => Ok(None),
        Some(serde_json::Value::Bool(enabled)) => Ok(Some(*enabled)),
        Some(other) => Err(format!("'enabled' must be a boolean, got {other}")),
    }
}

/// `PATCH /v1/tasks/{name}[?run=now|inspect]` with body `{ "enabled": bool }`.
pub async fn update_task(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let run = match run_option_from_query(uri.query()) {
        Ok(run) => run,
        Err(message) => {
            return ApiError::new(request_id, StatusCode::BAD_REQUEST, message).into_response()
        }
    };
    let enabled = match decode_patch(&body) {
        Ok(enabled) => enabled,
        Err(message) => {
            return ApiError::new(request_id, StatusCode::BAD_REQUEST, message).into_response()
        }
    };
    if let Some(enabled) = enabled {
        tracing::info!(
            target: "catsync::api",
            task = %name,
            enabled,
            "updating task"
        );
    }

    match state
        .controller
        .patch_task(&name, TaskPatch { enabled, run })
        .await
    {
        Ok(plan) => Json(TaskResponse {
            request_id: request_id.0,
            plan,
        })
        .into_response(),
        Err(err) => ApiError::from_domain(request_id, err).into_response(),
    }
}

/// `DELETE /v1/tasks/{name}`: refuses while a run is in flight (409),
/// otherwise accepts with 202.
pub async fn delete_task(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Response {
    match state.controller.delete_task(&name).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(TaskResponse {
                request_id: request_id.0,
                plan: None,
            }),
        )
            .into_response(),
        Err(err) => ApiError::from_domain(request_id, err).into_response(),
    }
}
