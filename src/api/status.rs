//! Read-only status endpoints.

use axum::extract::{OriginalUri, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::event::Event;
use crate::services::controller::{StatusSummary, TaskStatusReport};

use super::{task_name_from_path, ApiError, ApiState, RequestId};

const TASKS_PREFIX: &str = "/v1/status/tasks";

#[derive(Serialize)]
pub struct OverallStatusResponse {
    pub request_id: Uuid,
    pub task_summary: StatusSummary,
}

#[derive(Serialize)]
pub struct TaskStatusResponse {
    pub request_id: Uuid,
    pub tasks: Vec<TaskStatusEntry>,
}

#[derive(Serialize)]
pub struct TaskStatusEntry {
    #[serde(flatten)]
    pub report: TaskStatusReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

#[derive(Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub include: Option<String>,
}

/// `GET /v1/status`
pub async fn overall_status(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    let summary = state.controller.summary().await;
    Json(OverallStatusResponse {
        request_id: request_id.0,
        task_summary: summary,
    })
    .into_response()
}

/// `GET /v1/status/tasks` and `GET /v1/status/tasks/{name}`.
pub async fn task_status(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<StatusParams>,
) -> Response {
    let name = match task_name_from_path(uri.path(), TASKS_PREFIX) {
        Ok(name) => name,
        Err(message) => {
            return ApiError::new(request_id, StatusCode::BAD_REQUEST, message).into_response()
        }
    };
    let include_events = match params.include.as_deref() {
        None => false,
        Some("events") => true,
        Some(other) => {
            return ApiError::new(
                request_id,
                StatusCode::BAD_REQUEST,
                format!("unsupported include parameter '{other}'"),
            )
            .into_response()
        }
    };

    let tasks = if name.is_empty() {
        let mut events_by_task = if include_events {
            state.controller.events().all_events()
        } else {
            Default::default()
        };
        state
            .controller
            .task_statuses()
            .await
            .into_iter()
            .map(|report| {
                let events = include_events
                    .then(|| events_by_task.remove(&report.task_name).unwrap_or_default());
                TaskStatusEntry { report, events }
            })
            .collect()
    } else {
        match state.controller.task_status(&name).await {
            Ok(report) => {
                let events =
                    include_events.then(|| state.controller.events().task_events(&name));
                vec![TaskStatusEntry { report, events }]
            }
            Err(err) => return ApiError::from_domain(request_id, err).into_response(),
        }
    };

    Json(TaskStatusResponse {
        request_id: request_id.0,
        tasks,
    })
    .into_response()
}
