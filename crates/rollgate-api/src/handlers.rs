//! Management and read API handlers.
//!
//! Writes go straight to `StateStore`, which enforces catalog integrity;
//! dangling references and integrity violations are reported as 400.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rollgate_rollout::RolloutError;
use rollgate_state::*;
use serde::Deserialize;

use crate::ApiState;

const DEFAULT_ACTIVITY_LIMIT: usize = 100;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_error(e: StateError) -> Response {
    let status = match e {
        StateError::Integrity(_) | StateError::NotFound(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

fn created<T: serde::Serialize>(result: StateResult<()>, value: T) -> Response {
    match result {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(value)).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /health
pub async fn health() -> &'static str {
    "ok"
}

// ── Catalog ────────────────────────────────────────────────────

/// POST /api/v1/apps
pub async fn put_application(
    State(state): State<ApiState>,
    Json(app): Json<Application>,
) -> impl IntoResponse {
    created(state.store.put_application(&app), app)
}

/// POST /api/v1/groups
pub async fn put_group(
    State(state): State<ApiState>,
    Json(group): Json<Group>,
) -> impl IntoResponse {
    created(state.store.put_group(&group), group)
}

/// GET /api/v1/groups/{id}
pub async fn get_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_group(&id) {
        Ok(Some(group)) => ApiResponse::ok(group).into_response(),
        Ok(None) => error_response("group not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/groups/{id}/stats
pub async fn get_group_stats(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.group_updates_stats(&id) {
        Ok(stats) => ApiResponse::ok(stats).into_response(),
        Err(RolloutError::InvalidApplicationOrGroup) => {
            error_response("group not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/channels
pub async fn put_channel(
    State(state): State<ApiState>,
    Json(channel): Json<Channel>,
) -> impl IntoResponse {
    created(state.store.put_channel(&channel), channel)
}

/// POST /api/v1/packages
pub async fn put_package(
    State(state): State<ApiState>,
    Json(package): Json<Package>,
) -> impl IntoResponse {
    created(state.store.put_package(&package), package)
}

// ── Rollout state ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/activity
pub async fn list_activity(
    State(state): State<ApiState>,
    Query(query): Query<ActivityQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    match state.store.list_activity(limit) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_instance(&id) {
        Ok(Some(instance)) => ApiResponse::ok(instance).into_response(),
        Ok(None) => error_response("instance not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(serde::Serialize)]
struct InstanceHistory {
    application: Option<InstanceApplication>,
    status_history: Vec<StatusHistoryEntry>,
    events: Vec<Event>,
}

/// GET /api/v1/instances/{id}/apps/{app_id}/history
pub async fn get_instance_history(
    State(state): State<ApiState>,
    Path((id, app_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let history = state
        .store
        .get_instance_application(&id, &app_id)
        .and_then(|application| {
            Ok(InstanceHistory {
                application,
                status_history: state.store.list_status_history(&id, &app_id)?,
                events: state.store.list_events(&id, &app_id)?,
            })
        });
    match history {
        Ok(history) if history.application.is_none() => {
            error_response("instance application not found", StatusCode::NOT_FOUND).into_response()
        }
        Ok(history) => ApiResponse::ok(history).into_response(),
        Err(e) => store_error(e),
    }
}
