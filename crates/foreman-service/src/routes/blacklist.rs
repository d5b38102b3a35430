//! Circuit breaker / blacklist admin routes (§4.5, §4.7).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
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
pub struct BlacklistEntryView {
    pub workflow_id: String,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
    pub blacklisted_by: Option<String>,
    pub stuck_count: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddBlacklistRequest {
    pub workflow_id: String,
    pub note: String,
    pub by: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RemoveBlacklistParams {
    pub removed_by: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StuckHistoryEntryView {
    pub workflow_id: String,
    pub count: u64,
    pub last_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StuckHistoryParams {
    pub since: DateTime<Utc>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/admin/blacklist", get(list_blacklist).post(add_blacklist))
        .route("/v1/admin/blacklist/:workflow_id", axum::routing::delete(remove_blacklist))
        .route("/v1/admin/stuck-history", get(stuck_history))
        .with_state(state)
}

/// GET /v1/admin/blacklist — all currently quarantined workflows (§4.7).
#[utoipa::path(
    get,
    path = "/v1/admin/blacklist",
    responses((status = 200, description = "Active blacklist entries", body = Vec<BlacklistEntryView>)),
    tag = "admin-blacklist"
)]
pub async fn list_blacklist(State(state): State<AppState>) -> Result<Json<Vec<BlacklistEntryView>>, StatusCode> {
    let entries = state.admin.list_blacklist().await.map_err(|err| {
        tracing::error!(%err, "failed to list blacklist");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(entries.into_iter().map(to_view).collect()))
}

/// POST /v1/admin/blacklist — manually quarantine a workflow (§4.5).
#[utoipa::path(
    post,
    path = "/v1/admin/blacklist",
    request_body = AddBlacklistRequest,
    responses((status = 201, description = "Workflow blacklisted")),
    tag = "admin-blacklist"
)]
pub async fn add_blacklist(
    State(state): State<AppState>,
    Json(body): Json<AddBlacklistRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .admin
        .add_blacklist(body.workflow_id, body.note, body.by)
        .await
        .map_err(|err| {
            tracing::error!(%err, "failed to add blacklist entry");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(StatusCode::CREATED)
}

/// DELETE /v1/admin/blacklist/:workflow_id — lift a quarantine (§4.5:
/// "only an explicit admin removal clears a workflow's stuck counter").
#[utoipa::path(
    delete,
    path = "/v1/admin/blacklist/{workflow_id}",
    params(
        ("workflow_id" = String, Path, description = "Workflow to un-quarantine"),
        ("removed_by" = String, Query, description = "Admin identity performing the removal")
    ),
    responses((status = 204, description = "Blacklist entry removed")),
    tag = "admin-blacklist"
)]
pub async fn remove_blacklist(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(params): Query<RemoveBlacklistParams>,
) -> Result<StatusCode, StatusCode> {
    state
        .admin
        .remove_blacklist(&workflow_id, &params.removed_by)
        .await
        .map_err(|err| {
            tracing::error!(%err, "failed to remove blacklist entry");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/admin/stuck-history — per-workflow stuck counts since a point
/// in time (§4.7).
#[utoipa::path(
    get,
    path = "/v1/admin/stuck-history",
    params(("since" = DateTime<Utc>, Query, description = "Aggregate from this timestamp onward")),
    responses((status = 200, description = "Stuck counts per workflow", body = Vec<StuckHistoryEntryView>)),
    tag = "admin-blacklist"
)]
pub async fn stuck_history(
    State(state): State<AppState>,
    Query(params): Query<StuckHistoryParams>,
) -> Result<Json<Vec<StuckHistoryEntryView>>, StatusCode> {
    let rows = state.admin.stuck_history(params.since).await.map_err(|err| {
        tracing::error!(%err, "failed to aggregate stuck history");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(
        rows.into_iter()
            .map(|r| StuckHistoryEntryView {
                workflow_id: r.workflow_id,
                count: r.count,
                last_at: r.last_at,
            })
            .collect(),
    ))
}

fn to_view(entry: foreman_engine::model::BlacklistEntry) -> BlacklistEntryView {
    BlacklistEntryView {
        workflow_id: entry.workflow_id,
        reason: entry.reason,
        blacklisted_at: entry.blacklisted_at,
        blacklisted_by: entry.blacklisted_by,
        stuck_count: entry.stuck_count,
    }
}
