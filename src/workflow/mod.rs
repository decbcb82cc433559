/// Workflow Management Layer
///
/// This module handles workflow definitions, run records and persistence.
/// It provides:
/// - Type definitions (Workflow, Node, Edge, schedule config, run context)
/// - Run and log records
/// - The storage contract with SQLite (sqlx) and in-memory implementations

// Core workflow type definitions
pub mod types;

// Run records, metrics and log entries
pub mod run;

// Storage contract and SQLite persistence
pub mod storage;

// In-memory store for tests and ephemeral deployments
pub mod memory;

// Re-export commonly used types
pub use memory::MemoryStore;
pub use run::{LogEntry, LogLevel, Run, RunMetrics, RunStatus, RunSummary};
pub use storage::{ScheduledWorkflow, SqliteStore, WorkflowMetadata, WorkflowStore};
pub use types::{Edge, Node, NodeOutcome, NodeType, RunContext, ScheduleConfig, Workflow, WorkflowStatus};
