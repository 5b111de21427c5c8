use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::host::WorkflowHost;

/// Graceful shutdown coordinator for the onboarding host
pub struct ShutdownCoordinator {
    host: Arc<WorkflowHost>,
}

impl ShutdownCoordinator {
    pub fn new(host: Arc<WorkflowHost>) -> Self {
        Self { host }
    }

    /// Drive `work` to completion unless SIGINT arrives first.
    /// Returns `None` when interrupted; the host has been shut down by then.
    pub async fn run_until_signal<F, T>(&self, work: F) -> Result<Option<T>>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            output = work => Ok(Some(output)),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                self.shutdown_all_services().await;
                Ok(None)
            }
        }
    }

    /// Stop running instances and flush final metrics
    pub async fn shutdown_all_services(&self) {
        info!("Initiating graceful shutdown of the workflow host...");

        // In-flight instances stay Running on disk and are picked up by `resume`
        self.host.shutdown().await;

        crate::telemetry::shutdown_telemetry();
        info!("Graceful shutdown completed successfully");
    }
}
