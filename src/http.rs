//! HTTP routes over the pool operations.
//!
//! Workers authenticate with `Authorization: Bearer <token>`; admin routes
//! require `X-Admin-Token`. Errors render as [`ErrorResponse`] JSON.

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::auth::{admin_token_matches, bearer_token};
use crate::error::{ErrorKind, ErrorResponse, PoolError};
use crate::model::{
    AuditEvent, HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest, RepoCreateRequest,
    Repository, SystemState, Task, TaskCreateRequest, TaskStatusUpdateRequest,
    TaskStatusUpdateResponse, WorkResponse,
};
use crate::pool::WorkPool;
use crate::reconciler::ReconcilerStatus;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub pool: WorkPool,
}

/// Body returned by registration; the only time the token is ever sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerResponse {
    pub worker_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub reconciler: ReconcilerStatus,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    event_type: Option<String>,
    limit: Option<i64>,
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        if self.kind == ErrorKind::InternalError {
            error!(error = %self, details = ?self.details, "Request failed");
        }
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = self.to_response();
        (status, Json(body)).into_response()
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, PoolError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| PoolError::validation("Invalid request body").with_details(e.body_text()))
}

fn worker_token(headers: &HeaderMap) -> Result<&str, PoolError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| PoolError::auth("Missing or malformed bearer token"))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), PoolError> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if admin_token_matches(presented, &state.pool.config().admin_token) {
        Ok(())
    } else {
        Err(PoolError::auth("Invalid admin token"))
    }
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        reconciler: state.pool.reconciler().status().await,
    })
}

/// POST /v1/workers/register
async fn register_worker(
    State(state): State<AppState>,
    payload: Result<Json<RegisterWorkerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterWorkerResponse>), PoolError> {
    let reg = state.pool.register_worker(json_body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterWorkerResponse {
            worker_id: reg.worker_id,
            token: reg.credential.expose_secret().to_string(),
        }),
    ))
}

/// An empty heartbeat body reports `idle`.
fn heartbeat_body(body: &[u8]) -> Result<HeartbeatRequest, PoolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(HeartbeatRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| PoolError::validation("Invalid request body").with_details(e.to_string()))
}

/// POST /v1/workers/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HeartbeatResponse>, PoolError> {
    let token = worker_token(&headers)?;
    let resp = state.pool.heartbeat(token, heartbeat_body(&body)?).await?;
    Ok(Json(resp))
}

/// GET /v1/work
async fn fetch_work(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WorkResponse>, PoolError> {
    let token = worker_token(&headers)?;
    Ok(Json(state.pool.fetch_work(token).await?))
}

/// POST /v1/tasks/{task_id}/status
async fn update_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<TaskStatusUpdateRequest>, JsonRejection>,
) -> Result<Json<TaskStatusUpdateResponse>, PoolError> {
    let token = worker_token(&headers)?;
    let resp = state
        .pool
        .update_task_status(token, &task_id, json_body(payload)?)
        .await?;
    Ok(Json(resp))
}

/// POST /v1/admin/repos
async fn create_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RepoCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Repository>), PoolError> {
    require_admin(&state, &headers)?;
    let repo = state.pool.create_repository(json_body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

/// POST /v1/admin/tasks
async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<TaskCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), PoolError> {
    require_admin(&state, &headers)?;
    let task = state.pool.create_task(json_body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /v1/admin/state
async fn system_state(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SystemState>, PoolError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.pool.system_state().await?))
}

/// GET /v1/admin/audit?event_type=&limit=
async fn audit_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, PoolError> {
    require_admin(&state, &headers)?;
    let events = state
        .pool
        .list_audit_events(query.event_type.as_deref(), query.limit.unwrap_or(100))
        .await?;
    Ok(Json(events))
}

/// Build the worker-pool routes.
pub fn router(pool: WorkPool) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/workers/register", post(register_worker))
        .route("/v1/workers/heartbeat", post(heartbeat))
        .route("/v1/work", get(fetch_work))
        .route("/v1/tasks/{task_id}/status", post(update_task_status))
        .route("/v1/admin/repos", post(create_repository))
        .route("/v1/admin/tasks", post(create_task))
        .route("/v1/admin/state", get(system_state))
        .route("/v1/admin/audit", get(audit_events))
        .with_state(AppState { pool })
}
