/// Runtime Execution Engine
///
/// This module provides the petgraph-based DAG execution engine for workflows.
/// It handles:
/// - Converting workflows to petgraph DAGs
/// - Layered execution of nodes in dependency order
/// - Node handlers and their outbound collaborators (mail, cache)
/// - Cron subscriptions reconciled against persisted schedules

// Best-effort key/value cache
pub mod cache;

// Core execution engine using petgraph for DAG processing
pub mod engine;

// Individual node execution handlers
pub mod executor;

// Restricted condition expression language
pub mod expression;

// Outbound mail transports
pub mod mail;

// Schedule reconciler driving cron-triggered executions
pub mod scheduler;

// Re-export main types
pub use cache::{Cache, MemoryCache, NoopCache};
pub use engine::ExecutionEngine;
pub use executor::NodeExecutor;
pub use mail::{DisabledTransport, HttpMailTransport, MailMessage, MailTransport};
pub use scheduler::{ReconcileReport, ScheduleReconciler, ScheduledSubscription};
