use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging for the orchestrator.
/// `RUST_LOG` overrides the configured level when it is set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Onboarding orchestrator telemetry initialized");
    Ok(())
}

/// Generate an identifier for a new workflow instance
pub fn generate_instance_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span carrying the attributes of one workflow instance
pub fn create_instance_span(workflow: &str, instance_id: &str) -> tracing::Span {
    tracing::info_span!(
        "workflow_instance",
        workflow.name = workflow,
        instance.id = instance_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully
pub fn shutdown_telemetry() {
    tracing::info!("Onboarding orchestrator telemetry shutdown complete");
}
