/// Workflow, run and log persistence
///
/// `WorkflowStore` is the storage contract the engine and the reconciler
/// consume. `SqliteStore` implements it on SQLite with sqlx; definitions are
/// stored as JSON while status/version and run fields get their own columns
/// for indexed lookups.

use crate::error::{FlowError, StoreError};
use crate::workflow::run::{LogEntry, LogLevel, Run, RunMetrics, RunStatus, RunUpdate};
use crate::workflow::types::{Node, ScheduleConfig, Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::str::FromStr;

/// An active workflow together with its schedule node
#[derive(Debug, Clone)]
pub struct ScheduledWorkflow {
    pub workflow: Workflow,
    pub schedule_node: Node,
}

impl ScheduledWorkflow {
    /// `Some` only for active workflows that contain a schedule node
    pub fn from_workflow(workflow: Workflow) -> Option<Self> {
        if workflow.status != WorkflowStatus::Active {
            return None;
        }
        let schedule_node = workflow.schedule_node()?.clone();
        Some(Self {
            workflow,
            schedule_node,
        })
    }

    pub fn schedule_config(&self) -> Result<ScheduleConfig, FlowError> {
        ScheduleConfig::from_node(&self.schedule_node)
    }
}

/// Basic workflow metadata for listing operations
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub version: i64,
    pub updated_at: String,
}

/// Storage contract for workflows, runs and run logs
///
/// Every method is an independent mutation; there are no cross-call
/// transactions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace a workflow, bumping its version. Returns the stored copy.
    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>, StoreError>;

    async fn delete_workflow(&self, id: &str) -> Result<bool, StoreError>;

    /// Active workflows that contain at least one schedule node
    async fn list_active_scheduled_workflows(&self) -> Result<Vec<ScheduledWorkflow>, StoreError>;

    /// Number of runs ever created for a workflow, any status
    async fn count_runs(&self, workflow_id: &str) -> Result<u64, StoreError>;

    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<(), StoreError>;

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError>;

    /// Runs for a workflow, newest first
    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>, StoreError>;

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError>;

    /// Log lines for a run ordered by timestamp, then insertion order
    async fn list_logs(&self, run_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Mark every non-terminal run as failed; returns how many were touched
    async fn fail_stale_runs(&self, message: &str) -> Result<u64, StoreError>;
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    /// SQLite connection pool
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create new storage instance with an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialise the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database; a single connection so every query sees it
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_workflows_status
            ON workflows(status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                trigger_payload JSON NOT NULL,
                total_nodes INTEGER NOT NULL DEFAULT 0,
                completed_nodes INTEGER NOT NULL DEFAULT 0,
                failed_nodes INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_workflow
            ON runs(workflow_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // seq breaks timestamp ties in insertion order
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_run_logs_run
            ON run_logs(run_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_workflows(&self, only_active: bool) -> Result<Vec<Workflow>, StoreError> {
        let sql = if only_active {
            "SELECT definition, status, version FROM workflows WHERE status = 'active' ORDER BY id"
        } else {
            "SELECT definition, status, version FROM workflows ORDER BY id"
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_workflow).collect()
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let definition_json = serde_json::to_string(workflow)?;

        let row = sqlx::query(
            r#"
            INSERT INTO workflows (id, name, status, version, definition, updated_at)
            VALUES (?, ?, ?, 1, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                version = workflows.version + 1,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            RETURNING version
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(&definition_json)
        .fetch_one(&self.pool)
        .await?;

        let mut stored = workflow.clone();
        stored.version = row.try_get("version")?;
        Ok(stored)
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query("SELECT definition, status, version FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowMetadata>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, status, version, updated_at FROM workflows ORDER BY updated_at DESC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            workflows.push(WorkflowMetadata {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                status: parse_workflow_status(&status)?,
                version: row.try_get("version")?,
                updated_at: row.try_get("updated_at")?,
            });
        }

        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active_scheduled_workflows(&self) -> Result<Vec<ScheduledWorkflow>, StoreError> {
        let workflows = self.load_workflows(true).await?;
        Ok(workflows
            .into_iter()
            .filter_map(ScheduledWorkflow::from_workflow)
            .collect())
    }

    async fn count_runs(&self, workflow_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS total FROM runs WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        Ok(count.max(0) as u64)
    }

    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, workflow_id, workflow_version, status, triggered_by, trigger_payload,
                total_nodes, completed_nodes, failed_nodes, error_message, started_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(run.workflow_version)
        .bind(run.status.as_str())
        .bind(&run.triggered_by)
        .bind(serde_json::to_string(&run.trigger_payload)?)
        .bind(i64::from(run.metrics.total_nodes))
        .bind(i64::from(run.metrics.completed_nodes))
        .bind(i64::from(run.metrics.failed_nodes))
        .bind(&run.error_message)
        .bind(run.started_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = COALESCE(?, status),
                total_nodes = COALESCE(?, total_nodes),
                completed_nodes = COALESCE(?, completed_nodes),
                failed_nodes = COALESCE(?, failed_nodes),
                error_message = COALESCE(?, error_message),
                completed_at = COALESCE(?, completed_at)
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.metrics.map(|m| i64::from(m.total_nodes)))
        .bind(update.metrics.map(|m| i64::from(m.completed_nodes)))
        .bind(update.metrics.map(|m| i64::from(m.failed_nodes)))
        .bind(&update.error_message)
        .bind(update.completed_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        // Nothing matched: either the run is missing or it is terminal and frozen
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM runs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            if !exists {
                return Err(StoreError::NotFound(format!("run {id}")));
            }
        }
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    async fn list_runs(&self, workflow_id: &str) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query("SELECT * FROM runs WHERE workflow_id = ? ORDER BY started_at DESC")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_logs (id, run_id, node_id, level, message, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.run_id)
        .bind(&entry.node_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(&self, run_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, run_id, node_id, level, message, timestamp FROM run_logs WHERE run_id = ? ORDER BY timestamp, seq",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let level: String = row.try_get("level")?;
            let timestamp: String = row.try_get("timestamp")?;
            entries.push(LogEntry {
                id: row.try_get("id")?,
                run_id: row.try_get("run_id")?,
                node_id: row.try_get("node_id")?,
                level: LogLevel::from_str(&level).map_err(StoreError::Unavailable)?,
                message: row.try_get("message")?,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }

        Ok(entries)
    }

    async fn fail_stale_runs(&self, message: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'failed', error_message = ?, completed_at = ?
            WHERE status IN ('pending', 'running')
            "#,
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn row_to_workflow(row: &SqliteRow) -> Result<Workflow, StoreError> {
    let definition_json: String = row.try_get("definition")?;
    let status: String = row.try_get("status")?;
    let mut workflow: Workflow = serde_json::from_str(&definition_json)?;

    // Columns are authoritative over the copy embedded in the JSON
    workflow.status = parse_workflow_status(&status)?;
    workflow.version = row.try_get("version")?;
    Ok(workflow)
}

fn row_to_run(row: &SqliteRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("trigger_payload")?;
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let total: i64 = row.try_get("total_nodes")?;
    let completed: i64 = row.try_get("completed_nodes")?;
    let failed: i64 = row.try_get("failed_nodes")?;

    Ok(Run {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        workflow_version: row.try_get("workflow_version")?,
        status: RunStatus::from_str(&status).map_err(StoreError::Unavailable)?,
        triggered_by: row.try_get("triggered_by")?,
        trigger_payload: serde_json::from_str(&payload)?,
        metrics: RunMetrics {
            total_nodes: total as u32,
            completed_nodes: completed as u32,
            failed_nodes: failed as u32,
        },
        error_message: row.try_get("error_message")?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_workflow_status(raw: &str) -> Result<WorkflowStatus, StoreError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(StoreError::from)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt timestamp '{raw}': {e}")))
}
