//! Workflow host: schedules onboarding instances, runs them on the tokio
//! runtime, routes external events to them and resumes them after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::activities::{OnboardingActivities, OnboardingActivityExecutor};
use crate::config::{HostConfig, OrchestratorConfig, WorkflowConfig};
use crate::models::{OnboardingPayload, OnboardingResult};
use crate::observability::WorkflowMetrics;
use crate::state_store::StateStore;
use crate::telemetry::{create_instance_span, generate_instance_id};
use crate::workflow::context::HostServices;
use crate::workflow::{
    onboarding_workflow, CheckpointReason, EventHub, FileSystemHistoryStore, HistoryStore,
    InMemoryHistoryStore, InboxEvent, InstanceRecord, OnboardingPhase, PersistenceError,
    RuntimeStatus, WorkflowContext, WorkflowError,
};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid workflow input: {reason}")]
    InvalidInput { reason: String },

    #[error("Workflow instance already exists: {instance_id}")]
    InstanceExists { instance_id: String },

    #[error("Workflow instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("Timed out after {waited_secs}s waiting for instance {instance_id}")]
    Timeout { instance_id: String, waited_secs: u64 },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Status snapshot of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub workflow_name: String,
    pub runtime_status: RuntimeStatus,
    pub phase: OnboardingPhase,
    pub input: OnboardingPayload,
    pub output: Option<OnboardingResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<&InstanceRecord> for InstanceMetadata {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            workflow_name: record.workflow_name.clone(),
            runtime_status: record.status,
            phase: record.phase,
            input: record.input.clone(),
            output: record.output,
            error: record.error.clone(),
            created_at: record.created_at,
            last_updated_at: record.updated_at,
        }
    }
}

/// Outcome of [`WorkflowHost::resume_incomplete`]
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<String>,
    pub terminated: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

pub struct WorkflowHost {
    workflow: WorkflowConfig,
    status_poll_interval: Duration,
    services: HostServices,
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl std::fmt::Debug for WorkflowHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHost")
            .field("workflow", &self.workflow)
            .field("status_poll_interval", &self.status_poll_interval)
            .finish()
    }
}

impl WorkflowHost {
    pub fn new(
        workflow: WorkflowConfig,
        host: &HostConfig,
        activities: Arc<dyn OnboardingActivities>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let services = HostServices {
            activities,
            history,
            events: EventHub::new(),
            activity_slots: Arc::new(Semaphore::new(host.max_concurrent_activities.max(1))),
            metrics: Arc::new(WorkflowMetrics::new()),
            inbox_poll_interval: host.inbox_poll_interval(),
        };

        Self {
            workflow,
            status_poll_interval: host.status_poll_interval(),
            services,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Host wired to the store-backed activities and the configured history store
    pub fn from_config(config: &OrchestratorConfig, store: Arc<dyn StateStore>) -> Self {
        let activities = OnboardingActivityExecutor::new(store, &config.workflow)
            .with_store_name(config.state_store.store_name.clone());

        let history: Arc<dyn HistoryStore> = match &config.persistence.directory {
            Some(directory) => Arc::new(FileSystemHistoryStore::new(
                directory,
                config.persistence.enable_integrity_checks,
            )),
            None => Arc::new(InMemoryHistoryStore::new()),
        };

        Self::new(config.workflow.clone(), &config.host, Arc::new(activities), history)
    }

    pub fn metrics(&self) -> Arc<WorkflowMetrics> {
        self.services.metrics.clone()
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        self.services.history.clone()
    }

    pub async fn schedule_new_workflow(
        &self,
        payload: OnboardingPayload,
    ) -> Result<String, HostError> {
        self.schedule_new_workflow_with_id(generate_instance_id(), payload)
            .await
    }

    pub async fn schedule_new_workflow_with_id(
        &self,
        instance_id: impl Into<String>,
        payload: OnboardingPayload,
    ) -> Result<String, HostError> {
        let instance_id = instance_id.into();
        payload
            .validate()
            .map_err(|reason| HostError::InvalidInput { reason })?;

        if self.services.history.load_instance(&instance_id).await?.is_some() {
            return Err(HostError::InstanceExists { instance_id });
        }

        let record = InstanceRecord::new(&instance_id, &self.workflow.workflow_name, payload);
        self.services
            .history
            .save_instance(&record, CheckpointReason::Scheduled)
            .await?;
        self.services.metrics.record_scheduled();

        info!(
            instance_id = %instance_id,
            workflow = %self.workflow.workflow_name,
            organization = %record.input.organization,
            num_of_users = record.input.num_of_users,
            "Scheduled onboarding workflow"
        );

        self.spawn_instance(record).await;
        Ok(instance_id)
    }

    pub async fn fetch_workflow_metadata(
        &self,
        instance_id: &str,
    ) -> Result<InstanceMetadata, HostError> {
        let record = self
            .services
            .history
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| HostError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        Ok(InstanceMetadata::from(&record))
    }

    /// Deliver a named event to an instance. The event is appended to the
    /// instance inbox before the instance is woken, so it survives a restart.
    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), HostError> {
        let record = self
            .services
            .history
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| HostError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        if record.status.is_terminal() {
            warn!(
                instance_id = %instance_id,
                event = %name,
                status = %record.status,
                "Ignoring event raised for a finished instance"
            );
            return Ok(());
        }

        self.services
            .history
            .append_inbox(instance_id, InboxEvent::new(name, payload))
            .await?;
        self.services.metrics.record_event_raised();
        self.services.events.signal(instance_id, name).await;

        info!(instance_id = %instance_id, event = %name, "Raised external event");
        Ok(())
    }

    /// Poll until the instance reaches a terminal status
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceMetadata, HostError> {
        let poll = async {
            loop {
                let metadata = self.fetch_workflow_metadata(instance_id).await?;
                if metadata.runtime_status.is_terminal() {
                    return Ok(metadata);
                }
                tokio::time::sleep(self.status_poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| HostError::Timeout {
                instance_id: instance_id.to_string(),
                waited_secs: timeout.as_secs(),
            })?
    }

    /// Replay every persisted instance that has not reached a terminal status
    pub async fn resume_incomplete(&self) -> Result<ResumeReport, HostError> {
        let mut report = ResumeReport::default();

        for instance_id in self.services.history.list_instances().await? {
            if self.is_tracked(&instance_id).await {
                continue;
            }

            match self.services.history.load_instance(&instance_id).await {
                Ok(Some(record)) if record.status == RuntimeStatus::Running => {
                    info!(
                        instance_id = %instance_id,
                        history_len = record.history.len(),
                        "Resuming onboarding workflow"
                    );
                    self.spawn_instance(record).await;
                    report.resumed.push(instance_id);
                }
                Ok(_) => {}
                Err(
                    e @ (PersistenceError::StateCorruption { .. }
                    | PersistenceError::VersionMismatch { .. }),
                ) => {
                    error!(instance_id = %instance_id, error = %e, "Cannot replay instance");
                    match self
                        .services
                        .history
                        .mark_terminated(&instance_id, &e.to_string())
                        .await
                    {
                        Ok(()) => {
                            self.services.metrics.record_terminated();
                            report.terminated.push(instance_id);
                        }
                        Err(mark_err) => report.skipped.push((instance_id, mark_err.to_string())),
                    }
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "Skipping unreadable instance");
                    report.skipped.push((instance_id, e.to_string()));
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            terminated = report.terminated.len(),
            skipped = report.skipped.len(),
            "Resume pass finished"
        );
        Ok(report)
    }

    /// Instances whose task is still running on this host
    pub async fn active_instances(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Stop every running instance. Their records stay `Running` so a later
    /// [`resume_incomplete`](Self::resume_incomplete) continues them.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = self.tasks.lock().await.drain().collect();
        info!(instances = tasks.len(), "Shutting down workflow host");

        for (instance_id, task) in tasks {
            if !task.is_finished() {
                info!(instance_id = %instance_id, "Suspending in-flight instance");
            }
            task.abort();
            let _ = task.await;
        }

        self.services.activity_slots.close();
        self.services.metrics.log_stats();
    }

    async fn is_tracked(&self, instance_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(instance_id)
            .is_some_and(|task| !task.is_finished())
    }

    async fn spawn_instance(&self, record: InstanceRecord) {
        let instance_id = record.instance_id.clone();
        let span = create_instance_span(&self.workflow.workflow_name, &instance_id);
        let task = tokio::spawn(
            run_instance(record, self.workflow.clone(), self.services.clone()).instrument(span),
        );

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(instance_id, task);
    }
}

/// Run the orchestrator over an instance record and persist its terminal status
async fn run_instance(record: InstanceRecord, workflow: WorkflowConfig, services: HostServices) {
    let instance_id = record.instance_id.clone();
    let payload = record.input.clone();

    let mut ctx = WorkflowContext::new(record, workflow, services.clone());
    let outcome = onboarding_workflow(&mut ctx, payload).await;
    let phase = ctx.phase();
    let mut record = ctx.into_record();
    record.phase = phase;

    match outcome {
        Ok(result) => {
            record.finish(RuntimeStatus::Completed, result, None);
            services.metrics.record_completed();
            info!(
                instance_id = %instance_id,
                processed = result.processed,
                phase = ?phase,
                "Onboarding workflow completed"
            );
        }
        Err(WorkflowError::Persistence(e)) => {
            error!(
                instance_id = %instance_id,
                error = %e,
                "History could not be persisted; instance left running for resume"
            );
            return;
        }
        Err(e) => {
            record.finish(
                RuntimeStatus::Failed,
                OnboardingResult::not_processed(),
                Some(e.to_string()),
            );
            services.metrics.record_failed();
            error!(
                instance_id = %instance_id,
                error = %e,
                phase = ?phase,
                "Onboarding workflow failed"
            );
        }
    }

    if let Err(e) = services
        .history
        .save_instance(&record, CheckpointReason::Finished)
        .await
    {
        error!(instance_id = %instance_id, error = %e, "Failed to persist terminal status");
    }
    if let Err(e) = services.history.clear_inbox(&instance_id).await {
        warn!(instance_id = %instance_id, error = %e, "Failed to clear inbox of finished instance");
    }
    services.events.close_instance(&instance_id).await;
}
