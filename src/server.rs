/// Server setup and initialization
///
/// Wires together all components: storage, node executor, execution engine,
/// schedule reconciler and HTTP routes.

use crate::{
    api::{create_execution_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::{
        cache::MemoryCache,
        engine::ExecutionEngine,
        executor::NodeExecutor,
        mail::{DisabledTransport, HttpMailTransport, MailTransport},
        scheduler::ScheduleReconciler,
    },
    workflow::storage::{SqliteStore, WorkflowStore},
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build every shared component from configuration
///
/// The reconciler is created but not started.
pub async fn create_state(config: &Config) -> Result<AppState> {
    ensure_database_dir(&config.database.url)?;

    tracing::info!("📋 Opening workflow store at {}", config.database.url);
    let store: Arc<dyn WorkflowStore> = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to open workflow database")?,
    );

    let mail: Arc<dyn MailTransport> = match &config.mail.endpoint {
        Some(endpoint) => {
            tracing::info!("📧 Mail relay configured: {}", endpoint);
            Arc::new(HttpMailTransport::new(endpoint.clone()))
        }
        None => {
            tracing::warn!("⚠️ No mail relay configured, email nodes will simulate sends");
            Arc::new(DisabledTransport)
        }
    };

    tracing::info!("⚙️ Initializing node executor");
    let executor = Arc::new(NodeExecutor::new(mail));

    tracing::info!("🚀 Initializing execution engine (max {} concurrent runs)",
        config.scheduler.max_concurrent_runs);
    let engine = Arc::new(
        ExecutionEngine::new(executor, Arc::clone(&store))
            .with_cache(Arc::new(MemoryCache::new()))
            .with_max_concurrent_runs(config.scheduler.max_concurrent_runs),
    );

    tracing::info!("⏰ Initializing schedule reconciler");
    let reconciler = Arc::new(
        ScheduleReconciler::new(Arc::clone(&store), Arc::clone(&engine))
            .await
            .context("Failed to initialize schedule reconciler")?
            .with_reconcile_interval(Duration::from_secs(config.scheduler.reconcile_interval_secs.max(1)))
            .with_stale_run_recovery(config.scheduler.recover_stale_runs),
    );

    Ok(AppState {
        store,
        engine,
        reconciler,
    })
}

/// Create the main Axum application with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Workflow management API routes
        .merge(create_workflow_routes())
        // Execution control and run inspection
        .merge(create_execution_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
///
/// Runs until ctrl-c, then stops the reconciler.
pub async fn start_server(config: Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowrunner server...");

    let state = create_state(&config).await?;
    let reconciler = Arc::clone(&state.reconciler);
    reconciler
        .start()
        .await
        .context("Failed to start schedule reconciler")?;

    let app = create_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler.stop().await?;
    tracing::info!("👋 Server stopped");
    Ok(())
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_database_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("⏹️ Shutdown signal received");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
