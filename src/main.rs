/// Flowrunner: workflow automation engine
///
/// Main entry point for the Flowrunner server. Loads configuration from the
/// environment and starts the HTTP server and schedule reconciler.

use flowrunner::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Execution control at /api/workflows/{id}/execute and /api/runs/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to 0.0.0.0:3004 and data/flowrunner.db)
    let config = Config::default();

    start_server(config).await
}
