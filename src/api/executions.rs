/// Execution REST API endpoints
///
/// Manual triggers, cancellation, and read access to runs and their logs.

use crate::{
    api::{workflows::AppState, ApiError},
    workflow::run::{Run, RunSummary},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

/// Header naming the user on whose behalf a manual run is started
pub const USER_ID_HEADER: &str = "x-user-id";

/// `triggered_by` for manual runs without a user header
pub const ANONYMOUS_USER: &str = "anonymous";

/// Create execution routes
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/workflows/{id}/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/logs", get(list_logs))
        .route("/api/runs/{id}/cancel", post(cancel_run))
}

/// Execute a workflow now
///
/// POST /api/workflows/{id}/execute
/// Body: optional JSON payload, exposed to nodes as `trigger`
///
/// Node failures are reported in the returned summary (`status: "failed"`),
/// not as an HTTP error.
async fn execute_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<RunSummary>, ApiError> {
    let payload: Value = if body.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("❌ Invalid JSON payload for workflow {}: {}", workflow_id, e);
            ApiError::bad_request(format!("invalid JSON payload: {e}"))
        })?
    };

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER);

    tracing::info!("📥 Manual execution of {} requested by {}", workflow_id, user_id);
    let summary = state
        .engine
        .trigger_execution(&workflow_id, payload, user_id)
        .await?;

    Ok(Json(summary))
}

/// GET /api/workflows/{id}/runs, newest first
async fn list_runs(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.store.list_runs(&workflow_id).await?;
    Ok(Json(json!({ "runs": runs })))
}

/// GET /api/runs/{id}
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    state
        .store
        .get_run(&run_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run not found: {run_id}")))
}

/// GET /api/runs/{id}/logs, oldest first
async fn list_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_run(&run_id).await?.is_none() {
        return Err(ApiError::not_found(format!("run not found: {run_id}")));
    }
    let logs = state.store.list_logs(&run_id).await?;
    Ok(Json(json!({ "logs": logs })))
}

/// Cancel an active run
///
/// POST /api/runs/{id}/cancel
/// Returns `{ "runId", "cancelled" }`; `cancelled` is false for runs that
/// already finished.
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_run(&run_id).await?.is_none() {
        return Err(ApiError::not_found(format!("run not found: {run_id}")));
    }
    let cancelled = state.engine.cancel_execution(&run_id).await?;
    Ok(Json(json!({ "runId": run_id, "cancelled": cancelled })))
}
