//! HTTP control API, versioned under `/v1`.
//!
//! Read endpoints snapshot state through the controller's reader lock;
//! mutations go through its writer lock. Every response carries a
//! `request_id`; errors use the `{ request_id, error: { message } }`
//! envelope.

pub mod server;
pub mod status;
pub mod task;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::ports::driver::RunOption;
use crate::services::controller::Controller;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
    pub auth_token: Option<Arc<String>>,
}

/// Per-request id, generated by middleware and echoed in every response.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub request_id: Uuid,
    pub error: ErrorBody,
}

/// An API failure paired with the status code it maps to.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub request_id: Uuid,
}

impl ApiError {
    pub fn new(request_id: RequestId, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            request_id: request_id.0,
        }
    }

    pub fn from_domain(request_id: RequestId, err: DomainError) -> Self {
        let status = match &err {
            DomainError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            DomainError::TaskActive(_) => StatusCode::CONFLICT,
            DomainError::Unauthorized => StatusCode::UNAUTHORIZED,
            DomainError::ValidationFailed(_)
            | DomainError::ConfigInvalid(_)
            | DomainError::CatalogBadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(request_id, status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            request_id: self.request_id,
            error: ErrorBody {
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Extract the task name from a status path. The path after the prefix may
/// be empty (all tasks), a bare name, or a name with a trailing slash;
/// anything deeper is an error.
pub fn task_name_from_path(path: &str, prefix: &str) -> Result<String, String> {
    let rest = path
        .strip_prefix(prefix)
        .ok_or_else(|| format!("path '{path}' does not start with '{prefix}'"))?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.contains('/') {
        return Err(format!("unsupported path '{path}'"));
    }
    Ok(rest.to_string())
}

/// Parse the `?run=` option. Only `now` and `inspect` are accepted, at most
/// once.
pub fn run_option_from_query(query: Option<&str>) -> Result<Option<RunOption>, String> {
    let values: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.strip_prefix("run="))
        .collect();
    match values.as_slice() {
        [] => Ok(None),
        [value] => RunOption::parse(value).map(Some).ok_or_else(|| {
            format!("unsupported run parameter value '{value}'; expected 'now' or 'inspect'")
        }),
        _ => Err(format!(
            "cannot support more than one run query parameter, got {} values",
            values.len()
        )),
    }
}

async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(id);
    next.run(request).await
}

async fn auth_layer(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(token) = &state.auth_token else {
        return next.run(request).await;
    };
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .copied()
        .unwrap_or(RequestId(Uuid::new_v4()));
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(token.as_str()) {
        return ApiError::from_domain(request_id, DomainError::Unauthorized).into_response();
    }
    next.run(request).await
}

/// Assemble the `/v1` router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/status", get(status::overall_status))
        .route("/v1/status/tasks", get(status::task_status))
        .route("/v1/status/tasks/", get(status::task_status))
        .route("/v1/status/tasks/{*rest}", get(status::task_status))
        .route("/v1/tasks", axum::routing::post(task::create_task))
        .route(
            "/v1/tasks/{name}",
            axum::routing::patch(task::update_task).delete(task::delete_task),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .layer(middleware::from_fn(request_id_layer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
