mod demo;

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tallyloom_durable::telemetry::{init_telemetry, TelemetryConfig};
use tallyloom_durable::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may be set directly
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - SERVICE_NAME: Service name (default: "tallyloom-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "tallyloom_durable=info,tallyloom_worker=debug")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "tallyloom" {
        telemetry_config.service_name = "tallyloom-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("tallyloom_durable=info,tallyloom_worker=debug".to_string());
    }
    init_telemetry(telemetry_config);

    tracing::info!("tallyloom-worker starting...");

    let config = OrchestratorConfig::from_env();

    tracing::info!(
        database_url = %config.database_url,
        max_workers = config.pool.max_workers,
        shutdown_timeout_ms = config.pool.shutdown_timeout.as_millis() as u64,
        "Opening orchestrator"
    );

    let orchestrator = Orchestrator::connect(config)
        .await
        .context("Failed to open workflow store")?;

    let demo_delay = std::env::var("DEMO_ACTIVITY_DELAY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(250));
    demo::register(&orchestrator, demo_delay).context("Failed to register demo handlers")?;

    let report = orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;
    tracing::info!(
        resubmitted = report.total_resubmitted(),
        skipped = report.skipped,
        "Orchestrator started"
    );

    if let Ok(raw_input) = std::env::var("DEMO_INPUT") {
        let workflow = std::env::var("DEMO_WORKFLOW")
            .unwrap_or_else(|_| demo::DEFAULT_DEMO_WORKFLOW.to_string());
        let input: Value =
            serde_json::from_str(&raw_input).context("DEMO_INPUT must be valid JSON")?;

        let id = orchestrator
            .invoke_workflow(&workflow, input)
            .await
            .with_context(|| format!("Failed to invoke workflow {workflow}"))?;
        tracing::info!(workflow_id = %id, %workflow, "Demo workflow invoked");

        let finished = orchestrator
            .wait_for_completion(id, Duration::from_secs(30))
            .await
            .context("Demo workflow did not finish")?;
        tracing::info!(
            workflow_id = %id,
            status = %finished.status,
            output = ?finished.output,
            error = ?finished.error_message,
            "Demo workflow finished"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    orchestrator
        .stop()
        .await
        .context("Failed to stop orchestrator")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
