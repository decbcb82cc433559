/// Error types for the execution engine, node executors and storage layer.
///
/// Library code returns these typed errors; the binary and server bootstrap
/// wrap them with `anyhow` for context.

use thiserror::Error;

/// Result type for engine and reconciler operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by a single node executor.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A required config key is absent or empty.
    #[error("missing configuration: '{field}'")]
    MissingConfiguration { field: String },

    /// A config key is present but unusable (bad method, bad header, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The remote backend (HTTP endpoint, mail relay) could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl NodeError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingConfiguration { field: field.into() }
    }
}

/// Errors from the workflow/run/log store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not serve the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A persisted document could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The addressed record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Top-level errors for executions and scheduling.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Missing or invalid configuration on a unit (node config, cron syntax).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The workflow graph violates a structural invariant.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A pass over the remaining nodes made no progress.
    #[error("circular dependency detected among nodes: {}", .nodes.join(", "))]
    CircularDependency { nodes: Vec<String> },

    /// A node failed; the remaining walk was aborted.
    #[error("node '{node_id}' failed: {cause}")]
    NodeExecution { node_id: String, cause: String },

    /// The workflow to execute does not exist.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The cron clock rejected an operation.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_dependency_lists_nodes() {
        let err = FlowError::CircularDependency {
            nodes: vec!["b".to_string(), "c".to_string()],
        };
        assert_eq!(err.to_string(), "circular dependency detected among nodes: b, c");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn missing_configuration_names_field() {
        let err = NodeError::missing("subject");
        assert!(err.to_string().contains("'subject'"));
    }
}
