/// Flowrunner: workflow automation engine
///
/// This library provides a petgraph-based DAG execution engine for workflow
/// definitions, a schedule reconciler that keeps cron subscriptions in sync
/// with persisted workflows, and the HTTP surface around both.

// Core configuration and setup
pub mod config;

// Typed errors shared by the engine, reconciler and stores
pub mod error;

// Workflow management layer - definitions, runs, logs and storage
pub mod workflow;

// Runtime execution engine - petgraph DAG execution, node handlers, scheduling
pub mod runtime;

// HTTP API layer - REST endpoints for workflows and executions
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{FlowError, NodeError, StoreError};
pub use runtime::{ExecutionEngine, NodeExecutor, ScheduleReconciler};
pub use server::start_server;
pub use workflow::{Edge, Node, NodeType, Run, RunStatus, RunSummary, Workflow, WorkflowStore};
