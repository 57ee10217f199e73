//! remedy-agent - one stage of the container remediation pipeline
//!
//! Runs the stage named by configuration against a shared coordinator, the
//! coordinator itself, or the whole pipeline in one process.

use anyhow::Result;
use remedy_lib::{EventLogger, HealthRegistry};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod stages;

/// How long in-flight handlers get to finish after Ctrl-C
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = match config::AgentConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to load configuration");
            return Err(e);
        }
    };
    let stage = config.stage;
    let api_port = config.api_port;
    info!(
        node_name = %config.node_name,
        stage = stage.as_str(),
        "Agent configured"
    );

    let logger = EventLogger::new(&config.node_name);
    let health_registry = HealthRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launched = match stages::launch(config, health_registry.clone(), shutdown_rx.clone()).await
    {
        Ok(launched) => launched,
        Err(e) => {
            error!(error = %format!("{:#}", e), stage = stage.as_str(), "Startup failed");
            return Err(e);
        }
    };

    // Mark agent as ready after initialization
    health_registry.set_ready(true);

    let api_handle = tokio::spawn(api::serve(api_port, launched.router, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown(stage.as_str(), "SIGINT received");
    health_registry.set_ready(false);
    let _ = shutdown_tx.send(true);

    let drain = async {
        for task in launched.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Stage task ended abnormally");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Drain timed out");
    }

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server stopped with an error"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
