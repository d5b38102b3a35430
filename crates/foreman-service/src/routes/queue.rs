//! In-flight execution queue admin route (§4.7: "list queue").

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use foreman_engine::admin::AdminOps;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminOps>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PendingExecutionView {
    pub execution_id: Uuid,
    pub workflow_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQueueParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

pub fn routes(state: AppState) -> Router {
    Router::new().route("/v1/admin/queue", get(list_queue)).with_state(state)
}

/// GET /v1/admin/queue — bounded snapshot of dispatched-but-not-yet-
/// finalized executions (§4.7). This is a point-in-time view, not a
/// durable queue listing: entries disappear once their terminal record
/// is written.
#[utoipa::path(
    get,
    path = "/v1/admin/queue",
    params(("limit" = Option<usize>, Query, description = "Max rows returned (default 100)")),
    responses((status = 200, description = "Pending executions", body = Vec<PendingExecutionView>)),
    tag = "admin-queue"
)]
pub async fn list_queue(
    State(state): State<AppState>,
    Query(params): Query<ListQueueParams>,
) -> Result<Json<Vec<PendingExecutionView>>, StatusCode> {
    let pending = state.admin.list_queue(params.limit);
    Ok(Json(
        pending
            .into_iter()
            .map(|p| PendingExecutionView {
                execution_id: p.execution_id,
                workflow_id: p.workflow_id,
                started_at: p.started_at,
            })
            .collect(),
    ))
}
