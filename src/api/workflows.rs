/// Workflow management REST API endpoints
///
/// Provides CRUD operations for workflow definitions. Every save or delete
/// runs a reconciliation pass so schedule changes take effect immediately.

use crate::{
    api::ApiError,
    runtime::{engine::ExecutionEngine, scheduler::ScheduleReconciler},
    workflow::{storage::WorkflowStore, types::Workflow},
};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow, run and log persistence
    pub store: Arc<dyn WorkflowStore>,
    /// DAG execution engine for manual triggers and cancellation
    pub engine: Arc<ExecutionEngine>,
    /// Schedule reconciler, re-run after every definition change
    pub reconciler: Arc<ScheduleReconciler>,
}

/// Response for workflow save operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub version: i64,
    pub message: String,
}

/// Request body for workflow save
#[derive(Debug, Deserialize)]
pub struct SaveWorkflowRequest {
    pub workflow: Workflow,
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(save_workflow))
        .route("/api/workflows/{id}", get(get_workflow).delete(delete_workflow))
}

/// Create or update a workflow
///
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "status": "active", "nodes": [...], "edges": [...] } }
async fn save_workflow(
    State(state): State<AppState>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = payload.workflow;

    if workflow.id.trim().is_empty() || workflow.name.trim().is_empty() {
        return Err(ApiError::bad_request("workflow id and name are required"));
    }
    workflow.validate()?;

    let saved = state.store.save_workflow(&workflow).await?;
    tracing::info!("🔥 Saved workflow: {} ({}) v{}", saved.id, saved.name, saved.version);

    reconcile_after_change(&state, &saved.id).await;

    Ok(Json(WorkflowResponse {
        id: saved.id.clone(),
        version: saved.version,
        message: format!("Workflow '{}' saved successfully", saved.name),
    }))
}

/// List all workflows
///
/// GET /api/workflows
/// Returns: { "workflows": [{ "id", "name", "status", "version", "updatedAt" }] }
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let workflows = state.store.list_workflows().await?;
    Ok(Json(json!({ "workflows": workflows })))
}

/// Get a specific workflow by ID
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .store
        .get_workflow(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("workflow not found: {id}")))
}

/// Delete a workflow
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_workflow(&id).await? {
        return Err(ApiError::not_found(format!("workflow not found: {id}")));
    }
    tracing::info!("🗑️ Deleted workflow: {}", id);

    reconcile_after_change(&state, &id).await;

    Ok(Json(json!({ "message": "Workflow deleted successfully" })))
}

/// The definition is already persisted; a failed pass is retried on the
/// next interval
async fn reconcile_after_change(state: &AppState, workflow_id: &str) {
    match state.reconciler.reconcile().await {
        Ok(report) => tracing::debug!("🔄 Reconciled after change to {}: {:?}", workflow_id, report),
        Err(e) => tracing::error!("❌ Reconciliation after change to {} failed: {}", workflow_id, e),
    }
}
