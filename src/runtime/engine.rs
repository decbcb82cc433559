/// Petgraph-based DAG execution engine
///
/// Converts workflows into directed graphs and executes them in layered
/// passes: trigger nodes (no incoming edge) first, then repeated passes over
/// the remaining nodes in definition order, running every node whose
/// predecessors have all finished. A pass that runs nothing means the rest of
/// the graph sits on a cycle.

use crate::error::{FlowError, Result};
use crate::runtime::cache::{Cache, NoopCache};
use crate::runtime::executor::NodeExecutor;
use crate::workflow::run::{LogEntry, LogLevel, Run, RunMetrics, RunStatus, RunSummary, RunUpdate};
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{Node, NodeOutcome, RunContext, Workflow};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{RwLock, Semaphore};

/// Cache entries for in-flight runs expire on their own if never cleared
const RUN_CACHE_TTL: Duration = Duration::from_secs(3600);

/// DAG execution engine
///
/// Owns the set of active run ids used for cooperative cancellation and a
/// semaphore bounding how many runs may be in flight at once.
pub struct ExecutionEngine {
    /// Node executor for handling individual node execution
    executor: Arc<NodeExecutor>,
    /// Run and log persistence
    store: Arc<dyn WorkflowStore>,
    /// Best-effort status cache
    cache: Arc<dyn Cache>,
    /// Runs currently walking their graph
    active_runs: RwLock<HashSet<String>>,
    /// Bound on concurrently executing runs
    permits: Semaphore,
}

/// Internal representation of a workflow as a petgraph graph
#[derive(Debug)]
struct WorkflowGraph {
    /// The petgraph DiGraph structure; node indices follow definition order
    graph: DiGraph<Node, ()>,
}

impl WorkflowGraph {
    fn predecessors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    fn is_trigger(&self, index: NodeIndex) -> bool {
        self.predecessors(index).next().is_none()
    }
}

/// How the walk over the graph ended
enum WalkEnd {
    Finished,
    Cancelled,
    Aborted(FlowError),
}

impl ExecutionEngine {
    /// Default bound on concurrently executing runs
    pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 32;

    /// Create new execution engine with node executor and store
    pub fn new(executor: Arc<NodeExecutor>, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            executor,
            store,
            cache: Arc::new(NoopCache),
            active_runs: RwLock::new(HashSet::new()),
            permits: Semaphore::new(Self::DEFAULT_MAX_CONCURRENT_RUNS),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_max_concurrent_runs(mut self, max_runs: usize) -> Self {
        self.permits = Semaphore::new(max_runs.max(1));
        self
    }

    /// Whether a run is currently walking its graph
    pub async fn is_active(&self, run_id: &str) -> bool {
        self.active_runs.read().await.contains(run_id)
    }

    /// Load a workflow and execute it on behalf of `user_id`
    pub async fn trigger_execution(
        &self,
        workflow_id: &str,
        payload: Value,
        user_id: &str,
    ) -> Result<RunSummary> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| FlowError::WorkflowNotFound(workflow_id.to_string()))?;

        self.run(&workflow, payload, user_id).await
    }

    /// Execute a workflow definition against a trigger payload
    ///
    /// Errors are returned only when the run could not be started or its
    /// final state could not be persisted. Node failures and cycles end the
    /// run as `failed` and are reported through the summary.
    pub async fn run(&self, workflow: &Workflow, payload: Value, triggered_by: &str) -> Result<RunSummary> {
        // The semaphore is never closed, so acquire only waits
        let _permit = self.permits.acquire().await.ok();

        workflow.validate()?;
        let graph = self.build_workflow_graph(workflow);

        let run = Run::new(
            &workflow.id,
            workflow.version,
            triggered_by,
            payload.clone(),
            workflow.nodes.len() as u32,
        );
        let run_id = run.id.clone();

        // Registered before the record is visible so a cancel can always find it
        self.active_runs.write().await.insert(run_id.clone());
        let started = match self.store.create_run(&run).await {
            Ok(()) => {
                self.store
                    .update_run(&run_id, &RunUpdate::status(RunStatus::Running))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.active_runs.write().await.remove(&run_id);
            tracing::error!("❌ Failed to start run for workflow '{}': {}", workflow.id, e);
            return Err(e.into());
        }
        self.cache_set(&format!("run:{run_id}:status"), RunStatus::Running.as_str())
            .await;

        let workflow_start_time = std::time::Instant::now();
        tracing::info!("🚀 Starting workflow execution: {} (run {}, triggered by {})",
            workflow.id, run_id, triggered_by);
        self.log(LogEntry::workflow(
            &run_id,
            LogLevel::Info,
            format!("Workflow execution started (triggered by {triggered_by})"),
        ))
        .await;

        let mut context = RunContext::new(&run_id, payload);
        let end = self.walk(&graph, &mut context).await;

        let metrics = RunMetrics {
            total_nodes: workflow.nodes.len() as u32,
            completed_nodes: context.completed_count() as u32,
            failed_nodes: context.failed_count() as u32,
        };

        // Whoever removes the run from the active set owns its terminal status
        let still_active = self.active_runs.write().await.remove(&run_id);
        self.cache_del(&format!("run:{run_id}:status")).await;

        let (status, error_message) = match (&end, still_active) {
            (_, false) | (WalkEnd::Cancelled, _) => (RunStatus::Cancelled, None),
            (WalkEnd::Finished, true) => (RunStatus::Completed, None),
            (WalkEnd::Aborted(e), true) => (RunStatus::Failed, Some(e.to_string())),
        };

        let duration = workflow_start_time.elapsed();
        if still_active {
            let update = RunUpdate {
                metrics: Some(metrics),
                ..RunUpdate::finished(status, error_message.clone())
            };
            self.store.update_run(&run_id, &update).await?;

            match status {
                RunStatus::Completed => {
                    tracing::info!("🎉 Workflow '{}' run {} completed in {:?}", workflow.id, run_id, duration);
                    self.log(LogEntry::workflow(
                        &run_id,
                        LogLevel::Success,
                        format!("Workflow execution completed ({} nodes)", metrics.completed_nodes),
                    ))
                    .await;
                }
                _ => {
                    let message = error_message.clone().unwrap_or_default();
                    tracing::error!("❌ Workflow '{}' run {} failed in {:?}: {}", workflow.id, run_id, duration, message);
                    self.log(LogEntry::workflow(
                        &run_id,
                        LogLevel::Error,
                        format!("Workflow execution failed: {message}"),
                    ))
                    .await;
                }
            }
        } else {
            // The canceller already wrote the terminal status unless it raced
            // create_run; stores ignore updates to terminal runs
            self.store
                .update_run(&run_id, &RunUpdate::finished(RunStatus::Cancelled, None))
                .await?;
            tracing::info!("🛑 Workflow '{}' run {} stopped after cancellation", workflow.id, run_id);
        }

        Ok(RunSummary {
            run_id,
            status,
            output: context.output(),
            error_message,
        })
    }

    /// Cancel an active run
    ///
    /// Returns `false` (and changes nothing) when the run is not active,
    /// including runs that already reached a terminal state.
    pub async fn cancel_execution(&self, run_id: &str) -> Result<bool> {
        let was_active = self.active_runs.write().await.remove(run_id);
        if !was_active {
            tracing::debug!("⏭️ Cancel ignored, run {} is not active", run_id);
            return Ok(false);
        }

        self.cache_del(&format!("run:{run_id}:status")).await;
        self.store
            .update_run(run_id, &RunUpdate::finished(RunStatus::Cancelled, None))
            .await?;
        self.log(LogEntry::workflow(run_id, LogLevel::Warning, "Workflow execution cancelled"))
            .await;

        tracing::info!("🛑 Cancelled run {}", run_id);
        Ok(true)
    }

    /// Walk the graph in layered passes until every node ran, a node failed,
    /// the run was cancelled, or a pass made no progress
    async fn walk(&self, graph: &WorkflowGraph, context: &mut RunContext) -> WalkEnd {
        let order: Vec<NodeIndex> = graph.graph.node_indices().collect();
        let mut done: HashSet<NodeIndex> = HashSet::with_capacity(order.len());

        // Trigger nodes first, in definition order
        for &index in order.iter().filter(|&&i| graph.is_trigger(i)) {
            if !self.is_active(&context.run_id).await {
                return WalkEnd::Cancelled;
            }
            if let Err(e) = self.run_node(&graph.graph[index], context).await {
                return WalkEnd::Aborted(e);
            }
            done.insert(index);
        }

        while done.len() < order.len() {
            let mut progressed = false;

            for &index in &order {
                if done.contains(&index) || !graph.predecessors(index).all(|p| done.contains(&p)) {
                    continue;
                }
                if !self.is_active(&context.run_id).await {
                    return WalkEnd::Cancelled;
                }
                if let Err(e) = self.run_node(&graph.graph[index], context).await {
                    return WalkEnd::Aborted(e);
                }
                done.insert(index);
                progressed = true;
            }

            if !progressed {
                let remaining: Vec<String> = order
                    .iter()
                    .filter(|&&i| !done.contains(&i))
                    .map(|&i| graph.graph[i].id.clone())
                    .collect();
                tracing::error!("🔁 Circular dependency among nodes: {:?}", remaining);
                return WalkEnd::Aborted(FlowError::CircularDependency { nodes: remaining });
            }
        }

        WalkEnd::Finished
    }

    /// Execute one node, record its outcome and write its log lines
    async fn run_node(&self, node: &Node, context: &mut RunContext) -> Result<()> {
        let run_id = context.run_id.clone();
        let name = if node.label.is_empty() { &node.id } else { &node.label };

        tracing::info!("📍 Executing node '{}' (type: {})", node.id, node.node_type.as_str());
        self.log(LogEntry::new(
            &run_id,
            &node.id,
            LogLevel::Info,
            format!("Executing {} node '{}'", node.node_type.as_str(), name),
        ))
        .await;

        match self.executor.execute_node(node, context).await {
            Ok(outcome) if outcome.success => {
                if outcome.data.get("simulated") == Some(&Value::Bool(true)) {
                    let reason = outcome.data["transportError"].as_str().unwrap_or("unknown error");
                    self.log(LogEntry::new(
                        &run_id,
                        &node.id,
                        LogLevel::Warning,
                        format!("Mail transport unavailable, send simulated: {reason}"),
                    ))
                    .await;
                }
                self.log(LogEntry::new(&run_id, &node.id, LogLevel::Success, format!("Node '{name}' completed")))
                    .await;
                context.record(&node.id, outcome);
                Ok(())
            }
            Ok(outcome) => {
                let cause = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "node reported failure".to_string());
                self.log(LogEntry::new(&run_id, &node.id, LogLevel::Error, format!("Node '{name}' failed: {cause}")))
                    .await;
                context.record(&node.id, outcome);
                Err(FlowError::NodeExecution {
                    node_id: node.id.clone(),
                    cause,
                })
            }
            Err(e) => {
                let cause = e.to_string();
                self.log(LogEntry::new(&run_id, &node.id, LogLevel::Error, format!("Node '{name}' failed: {cause}")))
                    .await;
                context.record(&node.id, NodeOutcome::failure(json!({}), cause.clone()));
                Err(FlowError::NodeExecution {
                    node_id: node.id.clone(),
                    cause,
                })
            }
        }
    }

    /// Build a petgraph DiGraph from a validated workflow definition
    fn build_workflow_graph(&self, workflow: &Workflow) -> WorkflowGraph {
        tracing::debug!("🏗️ Building workflow graph for '{}' ({} nodes, {} edges)",
            workflow.id, workflow.nodes.len(), workflow.edges.len());

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &workflow.nodes {
            let node_index = graph.add_node(node.clone());
            node_id_to_index.insert(node.id.clone(), node_index);
        }

        for edge in &workflow.edges {
            if let (Some(&from), Some(&to)) = (
                node_id_to_index.get(&edge.source),
                node_id_to_index.get(&edge.target),
            ) {
                graph.add_edge(from, to, ());
            }
        }

        WorkflowGraph { graph }
    }

    /// Append a run log line; failures are reported but never abort the run
    async fn log(&self, entry: LogEntry) {
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::error!("❌ Failed to append log for run {}: {}", entry.run_id, e);
        }
    }

    async fn cache_set(&self, key: &str, value: &str) {
        if let Err(e) = self.cache.set(key, value.to_string(), Some(RUN_CACHE_TTL)).await {
            tracing::warn!("⚠️ Cache set failed for {}: {}", key, e);
        }
    }

    async fn cache_del(&self, key: &str) {
        if let Err(e) = self.cache.del(key).await {
            tracing::warn!("⚠️ Cache delete failed for {}: {}", key, e);
        }
    }
}
