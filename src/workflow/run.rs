/// Persisted run records and run log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Lifecycle status of a run
///
/// `pending -> running -> (completed | failed | cancelled)`. Terminal states
/// are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Node counters for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
}

/// One end-to-end execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub workflow_version: i64,
    pub status: RunStatus,
    /// "scheduler" for cron fires, otherwise the invoking user id
    pub triggered_by: String,
    pub trigger_payload: Value,
    pub metrics: RunMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// New run record in `pending` state
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: i64,
        triggered_by: impl Into<String>,
        trigger_payload: Value,
        total_nodes: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version,
            status: RunStatus::Pending,
            triggered_by: triggered_by.into(),
            trigger_payload,
            metrics: RunMetrics {
                total_nodes,
                ..Default::default()
            },
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(metrics) = update.metrics {
            self.metrics = metrics;
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// Partial run update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub metrics: Option<RunMetrics>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Terminal transition stamped with the completion time
    pub fn finished(status: RunStatus, error_message: Option<String>) -> Self {
        Self {
            status: Some(status),
            error_message,
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn metrics(metrics: RunMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..Default::default()
        }
    }
}

/// Short description of a run returned to invokers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// Node id -> outcome for every node that executed
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Severity of a run log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Node id used for run-level log lines
pub const WORKFLOW_LOG_SOURCE: &str = "workflow";

/// Append-only run log line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub run_id: String,
    /// Node id, or "workflow" for run-level lines
    pub node_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        run_id: impl Into<String>,
        node_id: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            node_id: node_id.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn workflow(run_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(run_id, WORKFLOW_LOG_SOURCE, level, message)
    }
}
