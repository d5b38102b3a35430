//! Worker presence & recycle routes (§4.6, §4.7).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use foreman_engine::admin::AdminOps;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminOps>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WorkerView {
    pub worker_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecycleRequest {
    pub pid: u32,
    pub reason: String,
    pub requested_by: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/admin/workers", get(list_workers))
        .route("/v1/admin/workers/:worker_id", get(get_worker))
        .route("/v1/admin/workers/:worker_id/recycle", post(recycle_process))
        .with_state(state)
}

/// GET /v1/admin/workers — list online workers (§4.7).
#[utoipa::path(
    get,
    path = "/v1/admin/workers",
    responses((status = 200, description = "Online workers", body = Vec<WorkerView>)),
    tag = "admin-workers"
)]
pub async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<WorkerView>>, StatusCode> {
    let workers = state.admin.list_workers().await.map_err(|err| {
        tracing::error!(%err, "failed to list workers");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(workers.into_iter().map(to_view).collect()))
}

/// GET /v1/admin/workers/:worker_id
#[utoipa::path(
    get,
    path = "/v1/admin/workers/{worker_id}",
    params(("worker_id" = String, Path, description = "Worker identity")),
    responses(
        (status = 200, description = "Worker found", body = WorkerView),
        (status = 404, description = "Worker not registered or offline")
    ),
    tag = "admin-workers"
)]
pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerView>, StatusCode> {
    let worker = state.admin.get_worker(&worker_id).await.map_err(|err| {
        tracing::error!(%err, "failed to load worker");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    worker.map(to_view).map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// POST /v1/admin/workers/:worker_id/recycle — publishes a recycle
/// command for the node owning `worker_id` (§4.7). Returns 202 since the
/// command is delivered asynchronously; there is no synchronous
/// confirmation that the target process actually recycled.
#[utoipa::path(
    post,
    path = "/v1/admin/workers/{worker_id}/recycle",
    params(("worker_id" = String, Path, description = "Worker identity")),
    request_body = RecycleRequest,
    responses((status = 202, description = "Recycle command published")),
    tag = "admin-workers"
)]
pub async fn recycle_process(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(body): Json<RecycleRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .admin
        .recycle_process(&worker_id, body.pid, body.reason, body.requested_by)
        .await
        .map_err(|err| {
            tracing::error!(%err, "failed to publish recycle command");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(StatusCode::ACCEPTED)
}

fn to_view(reg: foreman_engine::model::WorkerRegistration) -> WorkerView {
    WorkerView {
        worker_id: reg.worker_id,
        hostname: reg.hostname,
        started_at: reg.started_at,
    }
}
