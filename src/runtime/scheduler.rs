/// Schedule reconciler
///
/// Keeps one cron subscription per active workflow that carries a schedule
/// node, in sync with persisted state. Subscriptions are in-memory only and
/// are rebuilt by reconciliation passes: on startup, on a fixed interval and
/// whenever the API saves or deletes a workflow.

use crate::{
    error::{FlowError, Result},
    runtime::engine::ExecutionEngine,
    workflow::{
        run::RunSummary,
        storage::{ScheduledWorkflow, WorkflowStore},
        types::ScheduleConfig,
    },
};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// `triggered_by` recorded on runs started by a cron fire
pub const SCHEDULER_USER: &str = "scheduler";

/// Default time between reconciliation passes
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

/// Message written on runs left `running` by a previous process
pub const STALE_RUN_MESSAGE: &str = "interrupted by process restart";

/// A live cron subscription for one workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledSubscription {
    pub workflow_id: String,
    pub job_id: Uuid,
    pub cron_expression: String,
    pub timezone: String,
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub subscribed: usize,
    pub resubscribed: usize,
    pub unsubscribed: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Why a workflow may not (or may no longer) fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ineligible {
    NotStarted,
    Ended,
    QuotaReached,
}

impl std::fmt::Display for Ineligible {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ineligible::NotStarted => write!(f, "startDate is in the future"),
            Ineligible::Ended => write!(f, "endDate has passed"),
            Ineligible::QuotaReached => write!(f, "maxExecutions reached"),
        }
    }
}

/// State shared between the reconciler, its interval loop and cron callbacks
#[derive(Clone)]
struct Shared {
    store: Arc<dyn WorkflowStore>,
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<RwLock<JobScheduler>>,
    subscriptions: Arc<RwLock<HashMap<String, ScheduledSubscription>>>,
    /// Serializes passes triggered from different places
    pass_lock: Arc<Mutex<()>>,
}

/// Background reconciler driving scheduled workflow executions
pub struct ScheduleReconciler {
    shared: Shared,
    reconcile_interval: Duration,
    recover_stale_runs: bool,
    interval_loop: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl ScheduleReconciler {
    /// Create a reconciler with its own cron clock
    pub async fn new(store: Arc<dyn WorkflowStore>, engine: Arc<ExecutionEngine>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| FlowError::Scheduler(e.to_string()))?;

        Ok(Self {
            shared: Shared {
                store,
                engine,
                scheduler: Arc::new(RwLock::new(scheduler)),
                subscriptions: Arc::new(RwLock::new(HashMap::new())),
                pass_lock: Arc::new(Mutex::new(())),
            },
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            recover_stale_runs: true,
            interval_loop: Mutex::new(None),
        })
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_stale_run_recovery(mut self, enabled: bool) -> Self {
        self.recover_stale_runs = enabled;
        self
    }

    /// Sweep stale runs, run the initial pass, start the cron clock and the
    /// interval loop
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting schedule reconciler (interval {:?})", self.reconcile_interval);

        if self.recover_stale_runs {
            match self.shared.store.fail_stale_runs(STALE_RUN_MESSAGE).await {
                Ok(0) => {}
                Ok(count) => tracing::warn!("🧹 Marked {} interrupted runs as failed", count),
                Err(e) => tracing::error!("❌ Stale run sweep failed: {}", e),
            }
        }

        self.shared.reconcile_logged(Utc::now()).await;

        {
            let scheduler = self.shared.scheduler.read().await;
            scheduler
                .start()
                .await
                .map_err(|e| FlowError::Scheduler(e.to_string()))?;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let period = self.reconcile_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick completes immediately; the initial pass already ran
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.reconcile_logged(Utc::now()).await,
                    _ = &mut stop_rx => break,
                }
            }
            tracing::debug!("⏹️ Reconcile loop exited");
        });

        if let Some((old_tx, old_handle)) = self.interval_loop.lock().await.replace((stop_tx, handle)) {
            let _ = old_tx.send(());
            let _ = old_handle.await;
        }

        tracing::info!("✅ Schedule reconciler started");
        Ok(())
    }

    /// Stop the interval loop, drop every subscription and shut the clock down
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping schedule reconciler");

        if let Some((stop_tx, handle)) = self.interval_loop.lock().await.take() {
            let _ = stop_tx.send(());
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Reconcile loop ended abnormally: {}", e);
            }
        }

        let workflow_ids: Vec<String> = self.shared.subscriptions.read().await.keys().cloned().collect();
        for workflow_id in workflow_ids {
            self.shared.unsubscribe(&workflow_id).await;
        }

        {
            let mut scheduler = self.shared.scheduler.write().await;
            scheduler
                .shutdown()
                .await
                .map_err(|e| FlowError::Scheduler(e.to_string()))?;
        }

        tracing::info!("✅ Schedule reconciler stopped");
        Ok(())
    }

    /// Run one reconciliation pass now
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.shared.reconcile_at(Utc::now()).await
    }

    /// Run one reconciliation pass as of `now`
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        self.shared.reconcile_at(now).await
    }

    /// Handle a cron fire for `workflow_id` as of `now`
    ///
    /// Returns `None` when the workflow is no longer eligible; it is
    /// unsubscribed in that case.
    pub async fn fire(&self, workflow_id: &str, now: DateTime<Utc>) -> Result<Option<RunSummary>> {
        self.shared.fire(workflow_id, now).await
    }

    /// Snapshot of the live subscriptions, ordered by workflow id
    pub async fn subscriptions(&self) -> Vec<ScheduledSubscription> {
        let mut subscriptions: Vec<_> = self.shared.subscriptions.read().await.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        subscriptions
    }

    pub async fn is_subscribed(&self, workflow_id: &str) -> bool {
        self.shared.subscriptions.read().await.contains_key(workflow_id)
    }
}

impl Shared {
    async fn reconcile_logged(&self, now: DateTime<Utc>) {
        if let Err(e) = self.reconcile_at(now).await {
            tracing::error!("❌ Reconciliation pass failed, retrying next interval: {}", e);
        }
    }

    async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let _pass = self.pass_lock.lock().await;
        let scheduled = self.store.list_active_scheduled_workflows().await?;

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::with_capacity(scheduled.len());

        for entry in scheduled {
            let workflow_id = entry.workflow.id.clone();
            seen.insert(workflow_id.clone());
            self.reconcile_workflow(&workflow_id, &entry, now, &mut report)
                .await?;
        }

        let orphaned: Vec<String> = self
            .subscriptions
            .read()
            .await
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for workflow_id in orphaned {
            tracing::info!("🗑️ Workflow '{}' is no longer scheduled, unsubscribing", workflow_id);
            if self.unsubscribe(&workflow_id).await {
                report.unsubscribed += 1;
            }
        }

        if report.subscribed + report.resubscribed + report.unsubscribed > 0 {
            tracing::info!("🔄 Reconciled schedules: {:?}", report);
        } else {
            tracing::debug!("🔄 Schedules unchanged: {:?}", report);
        }
        Ok(report)
    }

    /// Bring one workflow's subscription in line with its persisted schedule
    async fn reconcile_workflow(
        &self,
        workflow_id: &str,
        entry: &ScheduledWorkflow,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let existing = self.subscriptions.read().await.get(workflow_id).cloned();

        let config = match entry.schedule_config() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("❌ Skipping schedule for workflow '{}': {}", workflow_id, e);
                if self.unsubscribe(workflow_id).await {
                    report.unsubscribed += 1;
                }
                report.skipped += 1;
                return Ok(());
            }
        };
        let cron_expression = normalize_cron(&config.cron_expression);
        let timezone = config.timezone().to_string();

        if let Some(existing) = existing {
            if let Some(reason) = self.ineligibility(workflow_id, &config, now, true).await? {
                tracing::info!("🛑 Unsubscribing workflow '{}': {}", workflow_id, reason);
                self.unsubscribe(workflow_id).await;
                report.unsubscribed += 1;
                return Ok(());
            }

            if existing.cron_expression == cron_expression && existing.timezone == timezone {
                tracing::debug!("✓ Workflow '{}' already subscribed ({})", workflow_id, cron_expression);
                report.unchanged += 1;
                return Ok(());
            }

            tracing::info!("🔥 Schedule changed for workflow '{}': {} ({}) -> {} ({})",
                workflow_id, existing.cron_expression, existing.timezone, cron_expression, timezone);
            self.unsubscribe(workflow_id).await;
            match self.build_job(workflow_id, &cron_expression, &timezone) {
                Ok(job) => {
                    self.subscribe(workflow_id, job, cron_expression, timezone).await?;
                    report.resubscribed += 1;
                }
                Err(e) => {
                    tracing::error!("❌ Dropping schedule for workflow '{}': {}", workflow_id, e);
                    report.unsubscribed += 1;
                }
            }
            return Ok(());
        }

        let job = match self.build_job(workflow_id, &cron_expression, &timezone) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("❌ Skipping schedule for workflow '{}': {}", workflow_id, e);
                report.skipped += 1;
                return Ok(());
            }
        };

        if let Some(reason) = self.ineligibility(workflow_id, &config, now, false).await? {
            tracing::debug!("⏭️ Not subscribing workflow '{}': {}", workflow_id, reason);
            report.skipped += 1;
            return Ok(());
        }

        self.subscribe(workflow_id, job, cron_expression, timezone).await?;
        report.subscribed += 1;
        Ok(())
    }

    /// Check date window and run quota; `startDate` only gates new subscriptions
    async fn ineligibility(
        &self,
        workflow_id: &str,
        config: &ScheduleConfig,
        now: DateTime<Utc>,
        subscribed: bool,
    ) -> Result<Option<Ineligible>> {
        if !subscribed && config.start_date.is_some_and(|start| start > now) {
            return Ok(Some(Ineligible::NotStarted));
        }
        if config.end_date.is_some_and(|end| end < now) {
            return Ok(Some(Ineligible::Ended));
        }
        if let Some(max) = config.max_executions {
            if self.store.count_runs(workflow_id).await? >= max {
                return Ok(Some(Ineligible::QuotaReached));
            }
        }
        Ok(None)
    }

    fn build_job(&self, workflow_id: &str, cron_expression: &str, timezone: &str) -> Result<Job> {
        let offset = parse_timezone(timezone)?;
        let shared = self.clone();
        let workflow_id = workflow_id.to_string();

        Job::new_async_tz(cron_expression, offset, move |_uuid, _l| {
            let shared = shared.clone();
            let workflow_id = workflow_id.clone();

            Box::pin(async move {
                tracing::debug!("🔔 Cron fired for workflow {}", workflow_id);
                match shared.fire(&workflow_id, Utc::now()).await {
                    Ok(Some(summary)) => {
                        tracing::info!("✅ Scheduled run {} of '{}' finished: {}",
                            summary.run_id, workflow_id, summary.status.as_str());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("❌ Scheduled execution of '{}' failed: {}", workflow_id, e);
                    }
                }
            })
        })
        .map_err(|e| FlowError::Configuration(format!("invalid cron expression '{cron_expression}': {e}")))
    }

    async fn subscribe(
        &self,
        workflow_id: &str,
        job: Job,
        cron_expression: String,
        timezone: String,
    ) -> Result<()> {
        let job_id = {
            let scheduler = self.scheduler.read().await;
            scheduler
                .add(job)
                .await
                .map_err(|e| FlowError::Scheduler(e.to_string()))?
        };

        tracing::info!("📅 Subscribed workflow '{}' to '{}' ({})", workflow_id, cron_expression, timezone);
        self.subscriptions.write().await.insert(
            workflow_id.to_string(),
            ScheduledSubscription {
                workflow_id: workflow_id.to_string(),
                job_id,
                cron_expression,
                timezone,
            },
        );
        Ok(())
    }

    /// Drop a subscription; returns whether one existed
    async fn unsubscribe(&self, workflow_id: &str) -> bool {
        let Some(subscription) = self.subscriptions.write().await.remove(workflow_id) else {
            return false;
        };

        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&subscription.job_id).await {
            tracing::warn!("⚠️ Failed to remove cron job for workflow {}: {}", workflow_id, e);
        } else {
            tracing::debug!("🛑 Removed cron job for workflow {}", workflow_id);
        }
        true
    }

    async fn fire(&self, workflow_id: &str, now: DateTime<Utc>) -> Result<Option<RunSummary>> {
        let scheduled = self
            .store
            .get_workflow(workflow_id)
            .await?
            .and_then(ScheduledWorkflow::from_workflow);
        let Some(scheduled) = scheduled else {
            tracing::debug!("⏭️ Workflow '{}' is gone or inactive, self-unscheduling", workflow_id);
            self.unsubscribe(workflow_id).await;
            return Ok(None);
        };

        let config = scheduled.schedule_config()?;
        if config.end_date.is_some_and(|end| end < now) {
            tracing::info!("🛑 Workflow '{}' reached its endDate, self-unscheduling", workflow_id);
            self.unsubscribe(workflow_id).await;
            return Ok(None);
        }

        let prior_runs = self.store.count_runs(workflow_id).await?;
        if config.max_executions.is_some_and(|max| prior_runs >= max) {
            tracing::info!("🛑 Workflow '{}' reached maxExecutions ({}), self-unscheduling",
                workflow_id, prior_runs);
            self.unsubscribe(workflow_id).await;
            return Ok(None);
        }

        let payload = json!({
            "scheduledAt": now.to_rfc3339(),
            "trigger": "schedule",
            "executionCount": prior_runs + 1,
        });

        tracing::info!("🚀 Executing scheduled workflow: {} (execution #{})", workflow_id, prior_runs + 1);
        let summary = self
            .engine
            .run(&scheduled.workflow, payload, SCHEDULER_USER)
            .await?;
        Ok(Some(summary))
    }
}

/// Five-field expressions get a leading `0` seconds field
fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// `UTC`/`Z`/`GMT` or a fixed offset such as `+02:00`, `-0530`
fn parse_timezone(timezone: &str) -> Result<FixedOffset> {
    let tz = timezone.trim();
    let unsupported =
        || FlowError::Configuration(format!("unsupported timezone '{tz}', use UTC or a fixed offset like +02:00"));

    if matches!(tz.to_ascii_uppercase().as_str(), "UTC" | "Z" | "GMT" | "ETC/UTC") {
        return FixedOffset::east_opt(0).ok_or_else(unsupported);
    }

    let (sign, rest) = if let Some(rest) = tz.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = tz.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(unsupported());
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(unsupported());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| unsupported())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| unsupported())?;
    if hours > 14 || minutes > 59 {
        return Err(unsupported());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{executor::NodeExecutor, mail::DisabledTransport};
    use crate::workflow::memory::MemoryStore;
    use crate::workflow::run::{Run, RunStatus};
    use crate::workflow::types::{Edge, Node, NodeType, Workflow, WorkflowStatus};
    use serde_json::Value;

    fn scheduled_workflow(id: &str, schedule: Value) -> Workflow {
        Workflow {
            id: id.to_string(),
            name: format!("{id} workflow"),
            status: WorkflowStatus::Active,
            version: 0,
            nodes: vec![
                Node {
                    id: "tick".to_string(),
                    node_type: NodeType::Schedule,
                    label: "Every five minutes".to_string(),
                    config: schedule,
                },
                Node {
                    id: "note".to_string(),
                    node_type: NodeType::Other("noop".to_string()),
                    label: String::new(),
                    config: json!({}),
                },
            ],
            edges: vec![Edge {
                id: "e1".to_string(),
                source: "tick".to_string(),
                target: "note".to_string(),
                condition: None,
            }],
        }
    }

    async fn reconciler() -> (ScheduleReconciler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(NodeExecutor::new(Arc::new(DisabledTransport)));
        let engine = Arc::new(ExecutionEngine::new(executor, store.clone()));
        let reconciler = ScheduleReconciler::new(store.clone(), engine).await.unwrap();
        (reconciler, store)
    }

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron(" 30  */5 * * * * "), "30 */5 * * * *");
    }

    #[test]
    fn timezone_parsing() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_timezone("-0530").unwrap().local_minus_utc(), -19800);
        assert!(matches!(parse_timezone("Europe/Paris"), Err(FlowError::Configuration(_))));
        assert!(parse_timezone("+25:00").is_err());
    }

    #[tokio::test]
    async fn passes_are_idempotent() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow("wf-1", json!({ "cronExpression": "*/5 * * * *" })))
            .await
            .unwrap();

        let first = reconciler.reconcile().await.unwrap();
        assert_eq!(first.subscribed, 1);
        let before = reconciler.subscriptions().await;

        let second = reconciler.reconcile().await.unwrap();
        assert_eq!(second, ReconcileReport { unchanged: 1, ..Default::default() });
        assert_eq!(reconciler.subscriptions().await, before);
        assert_eq!(before[0].cron_expression, "0 */5 * * * *");
        assert_eq!(before[0].timezone, "UTC");
    }

    #[tokio::test]
    async fn changed_cron_resubscribes() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow("wf-1", json!({ "cronExpression": "*/5 * * * *" })))
            .await
            .unwrap();
        reconciler.reconcile().await.unwrap();
        let old_job = reconciler.subscriptions().await[0].job_id;

        store
            .save_workflow(&scheduled_workflow(
                "wf-1",
                json!({ "cronExpression": "0 9 * * *", "timezone": "+02:00" }),
            ))
            .await
            .unwrap();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.resubscribed, 1);

        let subscription = &reconciler.subscriptions().await[0];
        assert_ne!(subscription.job_id, old_job);
        assert_eq!(subscription.cron_expression, "0 0 9 * * *");
        assert_eq!(subscription.timezone, "+02:00");
    }

    #[tokio::test]
    async fn deactivated_workflows_are_unsubscribed() {
        let (reconciler, store) = reconciler().await;
        let mut wf = scheduled_workflow("wf-1", json!({ "cronExpression": "*/5 * * * *" }));
        store.save_workflow(&wf).await.unwrap();
        reconciler.reconcile().await.unwrap();
        assert!(reconciler.is_subscribed("wf-1").await);

        wf.status = WorkflowStatus::Inactive;
        store.save_workflow(&wf).await.unwrap();
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.unsubscribed, 1);
        assert!(!reconciler.is_subscribed("wf-1").await);
    }

    #[tokio::test]
    async fn invalid_schedules_are_skipped() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow("bad-cron", json!({ "cronExpression": "every tuesday" })))
            .await
            .unwrap();
        store
            .save_workflow(&scheduled_workflow(
                "bad-tz",
                json!({ "cronExpression": "*/5 * * * *", "timezone": "Europe/Paris" }),
            ))
            .await
            .unwrap();
        store
            .save_workflow(&scheduled_workflow("no-cron", json!({})))
            .await
            .unwrap();
        store
            .save_workflow(&scheduled_workflow("good", json!({ "cronExpression": "*/5 * * * *" })))
            .await
            .unwrap();

        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(report.subscribed, 1);
        let ids: Vec<_> = reconciler
            .subscriptions()
            .await
            .into_iter()
            .map(|s| s.workflow_id)
            .collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[tokio::test]
    async fn future_start_date_waits() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow(
                "wf-1",
                json!({ "cronExpression": "*/5 * * * *", "startDate": "2030-01-01T00:00:00Z" }),
            ))
            .await
            .unwrap();

        let before = parse_schedule_instant("2029-12-31T23:00:00Z");
        let report = reconciler.reconcile_at(before).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!reconciler.is_subscribed("wf-1").await);

        let after = parse_schedule_instant("2030-01-01T00:00:00Z");
        reconciler.reconcile_at(after).await.unwrap();
        assert!(reconciler.is_subscribed("wf-1").await);
    }

    #[tokio::test]
    async fn past_end_date_is_never_subscribed() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow(
                "wf-1",
                json!({ "cronExpression": "*/5 * * * *", "endDate": "2020-01-01" }),
            ))
            .await
            .unwrap();

        reconciler.reconcile().await.unwrap();
        assert!(!reconciler.is_subscribed("wf-1").await);
    }

    #[tokio::test]
    async fn max_executions_of_one_fires_once() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow(
                "wf-1",
                json!({ "cronExpression": "*/5 * * * *", "maxExecutions": 1 }),
            ))
            .await
            .unwrap();
        reconciler.reconcile().await.unwrap();
        assert!(reconciler.is_subscribed("wf-1").await);

        let summary = reconciler.fire("wf-1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(summary.status, RunStatus::Completed);

        let run = store.get_run(&summary.run_id).await.unwrap().unwrap();
        assert_eq!(run.triggered_by, SCHEDULER_USER);
        assert_eq!(run.trigger_payload["trigger"], "schedule");
        assert_eq!(run.trigger_payload["executionCount"], 1);

        // The next pass drops the subscription
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.unsubscribed, 1);
        assert!(!reconciler.is_subscribed("wf-1").await);

        // A stray fire is refused
        assert!(reconciler.fire("wf-1", Utc::now()).await.unwrap().is_none());
        assert_eq!(store.count_runs("wf-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fire_after_end_date_self_unschedules() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow(
                "wf-1",
                json!({ "cronExpression": "*/5 * * * *", "endDate": "2030-06-01T00:00:00Z" }),
            ))
            .await
            .unwrap();
        reconciler
            .reconcile_at(parse_schedule_instant("2030-05-01T00:00:00Z"))
            .await
            .unwrap();
        assert!(reconciler.is_subscribed("wf-1").await);

        let late = parse_schedule_instant("2030-06-02T00:00:00Z");
        assert!(reconciler.fire("wf-1", late).await.unwrap().is_none());
        assert!(!reconciler.is_subscribed("wf-1").await);
        assert_eq!(store.count_runs("wf-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn storage_outage_keeps_live_set() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow("wf-1", json!({ "cronExpression": "*/5 * * * *" })))
            .await
            .unwrap();
        reconciler.reconcile().await.unwrap();

        store.set_unavailable(true);
        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, FlowError::Storage(_)));
        assert!(reconciler.is_subscribed("wf-1").await);

        store.set_unavailable(false);
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn start_sweeps_stale_runs_and_stop_clears() {
        let (reconciler, store) = reconciler().await;
        store
            .save_workflow(&scheduled_workflow("wf-1", json!({ "cronExpression": "0 0 1 1 *" })))
            .await
            .unwrap();
        let mut orphan = Run::new("wf-1", 1, "alice", json!({}), 2);
        orphan.status = RunStatus::Running;
        store.create_run(&orphan).await.unwrap();

        reconciler.start().await.unwrap();
        assert!(reconciler.is_subscribed("wf-1").await);
        let swept = store.get_run(&orphan.id).await.unwrap().unwrap();
        assert_eq!(swept.status, RunStatus::Failed);
        assert_eq!(swept.error_message.as_deref(), Some(STALE_RUN_MESSAGE));

        reconciler.stop().await.unwrap();
        assert!(reconciler.subscriptions().await.is_empty());
    }

    fn parse_schedule_instant(raw: &str) -> DateTime<Utc> {
        crate::workflow::types::parse_schedule_date(raw).unwrap()
    }
}
