/// Core workflow type definitions
///
/// Workflow definitions (nodes, edges, schedule config) and the run-scoped
/// execution context. Definitions are serialized as JSON for persistence and
/// for the HTTP surface, using camelCase keys.

use crate::error::FlowError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};

/// A complete workflow definition containing nodes and their connections
///
/// Read once at run start; the engine never mutates it. `version` is a
/// monotonically increasing counter maintained by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-daily-report")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Lifecycle status; only `active` workflows are scheduled
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Save counter, bumped on every store write
    #[serde(default)]
    pub version: i64,
    /// Nodes in definition order (this order is the execution tie-break)
    pub nodes: Vec<Node>,
    /// Edges connecting nodes
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Persisted lifecycle status of a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Inactive,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// A single step in the workflow DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "fetch-weather")
    pub id: String,
    /// The type of node which determines execution behavior
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Display label; not used by execution
    #[serde(default)]
    pub label: String,
    /// Node-specific configuration as flexible JSON
    #[serde(default)]
    pub config: Value,
}

impl Node {
    /// Read a string config key, treating empty strings as absent
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Node types understood by the executor
///
/// Serialized as the plain type string. Strings that match no known type are
/// kept verbatim in `Other` so unknown node types never fail to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    /// Marks the workflow as cron-driven; config holds a `ScheduleConfig`
    Schedule,
    /// Sends an email: { "to", "subject", "message" }
    Email,
    /// Calls an HTTP endpoint: { "url", "method"?, "headers"?, "body"? }
    HttpRequest,
    /// Suspends the run: { "delay": milliseconds }
    Delay,
    /// Evaluates a restricted boolean expression: { "condition" }
    Condition,
    /// Any other type string
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Schedule => "schedule",
            Self::Email => "email",
            Self::HttpRequest => "http-request",
            Self::Delay => "delay",
            Self::Condition => "condition",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for NodeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "schedule" => Self::Schedule,
            "email" => Self::Email,
            "http-request" => Self::HttpRequest,
            "delay" => Self::Delay,
            "condition" => Self::Condition,
            _ => Self::Other(value),
        }
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

/// Connection between two nodes in the workflow DAG
///
/// `condition` is carried for editors and persisted as-is; dependency
/// resolution only looks at `source` and `target`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Workflow {
    /// Check node id uniqueness and that every edge references existing nodes
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(FlowError::InvalidDefinition(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(FlowError::InvalidDefinition(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
        }

        Ok(())
    }

    /// First schedule-type node in definition order
    pub fn schedule_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.node_type == NodeType::Schedule)
    }
}

/// Recurrence settings embedded in a schedule node's config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    /// Cron expression, 5 fields (minute precision) or 6/7 fields (seconds first)
    pub cron_expression: String,
    /// "UTC" or a fixed offset such as "+02:00"; UTC when absent
    #[serde(default)]
    pub timezone: Option<String>,
    /// Not eligible before this instant
    #[serde(default, deserialize_with = "deserialize_schedule_date")]
    pub start_date: Option<DateTime<Utc>>,
    /// Not eligible after this instant
    #[serde(default, deserialize_with = "deserialize_schedule_date")]
    pub end_date: Option<DateTime<Utc>>,
    /// Lifetime run quota, counted over all runs of the workflow
    #[serde(default)]
    pub max_executions: Option<u64>,
}

impl ScheduleConfig {
    /// Extract the schedule config from a schedule node
    pub fn from_node(node: &Node) -> Result<Self, FlowError> {
        let config: ScheduleConfig = serde_json::from_value(node.config.clone()).map_err(|e| {
            FlowError::Configuration(format!("schedule node '{}': {}", node.id, e))
        })?;

        if config.cron_expression.trim().is_empty() {
            return Err(FlowError::Configuration(format!(
                "schedule node '{}' has an empty cronExpression",
                node.id
            )));
        }

        Ok(config)
    }

    pub fn timezone(&self) -> &str {
        self.timezone.as_deref().unwrap_or("UTC")
    }
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (midnight UTC)
fn deserialize_schedule_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };

    parse_schedule_date(&raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{raw}'")))
}

pub fn parse_schedule_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Outcome of a single node, recorded exactly once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failure(data: Value, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            error: Some(error.into()),
        }
    }
}

/// Run-scoped execution state
///
/// Holds the trigger payload and every recorded node outcome. One context
/// belongs to exactly one run and is never shared.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Run identifier this context belongs to
    pub run_id: String,
    /// Invoker-supplied payload, e.g. { scheduledAt, trigger, executionCount }
    pub trigger: Value,
    outcomes: HashMap<String, NodeOutcome>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, trigger: Value) -> Self {
        Self {
            run_id: run_id.into(),
            trigger,
            outcomes: HashMap::new(),
        }
    }

    /// Record a node's outcome; a second record for the same node is ignored
    pub fn record(&mut self, node_id: &str, outcome: NodeOutcome) -> bool {
        if self.outcomes.contains_key(node_id) {
            tracing::warn!("⚠️ Outcome for node '{}' already recorded, ignoring", node_id);
            return false;
        }
        self.outcomes.insert(node_id.to_string(), outcome);
        true
    }

    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(node_id)
    }

    pub fn is_done(&self, node_id: &str) -> bool {
        self.outcomes.contains_key(node_id)
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.values().filter(|o| !o.success).count()
    }

    /// Trigger payload field lookup
    pub fn trigger_field(&self, key: &str) -> Option<&Value> {
        self.trigger.get(key)
    }

    /// The document expressions are evaluated against:
    /// `{ "trigger": <payload>, "<nodeId>": { success, data, error? }, ... }`
    pub fn document(&self) -> Value {
        let mut doc = Map::new();
        for (node_id, outcome) in &self.outcomes {
            doc.insert(node_id.clone(), json!(outcome));
        }
        // Trigger payload wins over a node that happens to be named "trigger"
        doc.insert("trigger".to_string(), self.trigger.clone());
        Value::Object(doc)
    }

    /// Node id -> outcome map returned to the invoker
    pub fn output(&self) -> Value {
        let map: Map<String, Value> = self
            .outcomes
            .iter()
            .map(|(id, outcome)| (id.clone(), json!(outcome)))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::from(node_type.to_string()),
            label: String::new(),
            config: json!({}),
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            id: format!("{source}-{target}"),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
        }
    }

    #[test]
    fn node_type_round_trips_unknown_strings() {
        let parsed: Node = serde_json::from_value(json!({
            "id": "n1",
            "type": "slack-post",
            "config": {}
        }))
        .unwrap();
        assert_eq!(parsed.node_type, NodeType::Other("slack-post".to_string()));
        assert_eq!(json!(parsed)["type"], "slack-post");

        let http: Node =
            serde_json::from_value(json!({ "id": "n2", "type": "http-request" })).unwrap();
        assert_eq!(http.node_type, NodeType::HttpRequest);
        assert_eq!(http.config, Value::Null);
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_dangling_edges() {
        let mut wf = Workflow {
            id: "wf".to_string(),
            name: "wf".to_string(),
            status: WorkflowStatus::Active,
            version: 1,
            nodes: vec![node("a", "delay"), node("a", "delay")],
            edges: vec![],
        };
        assert!(matches!(wf.validate(), Err(FlowError::InvalidDefinition(_))));

        wf.nodes = vec![node("a", "delay"), node("b", "delay")];
        wf.edges = vec![edge("a", "missing")];
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("missing"));

        wf.edges = vec![edge("a", "b")];
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn schedule_config_accepts_dates_and_rfc3339() {
        let mut n = node("s", "schedule");
        n.config = json!({
            "cronExpression": "*/5 * * * *",
            "startDate": "2030-01-01",
            "endDate": "2031-06-01T12:00:00+02:00",
            "maxExecutions": 3
        });
        let config = ScheduleConfig::from_node(&n).unwrap();
        assert_eq!(config.timezone(), "UTC");
        assert_eq!(config.max_executions, Some(3));
        assert_eq!(
            config.start_date.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
        assert_eq!(
            config.end_date.unwrap().to_rfc3339(),
            "2031-06-01T10:00:00+00:00"
        );
    }

    #[test]
    fn schedule_config_requires_cron_expression() {
        let n = node("s", "schedule");
        assert!(matches!(
            ScheduleConfig::from_node(&n),
            Err(FlowError::Configuration(_))
        ));
    }

    #[test]
    fn run_context_records_each_node_once() {
        let mut ctx = RunContext::new("run-1", json!({ "trigger": "manual" }));
        assert!(ctx.record("a", NodeOutcome::success(json!({ "n": 1 }))));
        assert!(!ctx.record("a", NodeOutcome::success(json!({ "n": 2 }))));
        assert_eq!(ctx.outcome("a").unwrap().data["n"], 1);

        let doc = ctx.document();
        assert_eq!(doc["a"]["success"], true);
        assert_eq!(doc["trigger"]["trigger"], "manual");
    }
}
