/// HTTP API Layer
///
/// This module provides the REST API endpoints for workflow management
/// and execution control. It handles:
/// - Workflow CRUD operations (each change triggers a reconciliation pass)
/// - Manual execution triggers and cancellation
/// - Run and log inspection

use crate::error::{FlowError, StoreError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

// Workflow management endpoints (GET/POST/DELETE)
pub mod workflows;

// Execution trigger, cancellation and run inspection endpoints
pub mod executions;

// Re-export router builders
pub use executions::create_execution_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
}

/// Handler error carrying a status and a message
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        let (status, code) = match &e {
            FlowError::WorkflowNotFound(_) | FlowError::Storage(StoreError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            FlowError::InvalidDefinition(_) | FlowError::Configuration(_) => {
                (StatusCode::BAD_REQUEST, "invalid_workflow")
            }
            FlowError::CircularDependency { .. } | FlowError::NodeExecution { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "execution_failed")
            }
            FlowError::Storage(StoreError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
            }
            FlowError::Storage(_) | FlowError::Scheduler(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        Self {
            status,
            code,
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        FlowError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("❌ Request failed ({}): {}", self.status, self.message);
        } else {
            tracing::debug!("⚠️ Request rejected ({}): {}", self.status, self.message);
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_errors_map_to_statuses() {
        let missing: ApiError = FlowError::WorkflowNotFound("wf".to_string()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let down: ApiError = StoreError::Unavailable("db down".to_string()).into();
        assert_eq!(down.status, StatusCode::SERVICE_UNAVAILABLE);

        let invalid: ApiError = FlowError::InvalidDefinition("dup".to_string()).into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    }
}
