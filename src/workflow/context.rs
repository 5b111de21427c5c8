use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::EventHub;
use super::history::{HistoryEvent, InstanceRecord};
use super::persistence::{CheckpointReason, HistoryStore};
use super::progress::{Milestone, OnboardingPhase, ProgressTracker};
use super::WorkflowError;
use crate::activities::{ActivityCall, OnboardingActivities};
use crate::config::WorkflowConfig;
use crate::models::Notification;
use crate::observability::{OperationTimer, WorkflowMetrics};

/// Runtime services shared by every instance on a host
#[derive(Clone)]
pub struct HostServices {
    pub activities: Arc<dyn OnboardingActivities>,
    pub history: Arc<dyn HistoryStore>,
    pub events: EventHub,
    pub activity_slots: Arc<Semaphore>,
    pub metrics: Arc<WorkflowMetrics>,
    pub inbox_poll_interval: Duration,
}

/// Per-instance handle the orchestrator uses for every durable step.
///
/// Each step consumes one sequence number. A step whose outcome is already in
/// the history returns that outcome without touching the outside world; any
/// other step does the work, appends the outcome and checkpoints before
/// returning it.
pub struct WorkflowContext {
    record: InstanceRecord,
    next_seq: u64,
    workflow: WorkflowConfig,
    services: HostServices,
    progress: ProgressTracker,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("instance_id", &self.record.instance_id)
            .field("next_seq", &self.next_seq)
            .field("history_len", &self.record.history.len())
            .field("phase", &self.progress.phase())
            .finish()
    }
}

impl WorkflowContext {
    pub fn new(record: InstanceRecord, workflow: WorkflowConfig, services: HostServices) -> Self {
        let progress = ProgressTracker::new(record.instance_id.clone());
        Self {
            record,
            next_seq: 0,
            workflow,
            services,
            progress,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.record.instance_id
    }

    pub fn workflow_config(&self) -> &WorkflowConfig {
        &self.workflow
    }

    pub fn phase(&self) -> OnboardingPhase {
        self.progress.phase()
    }

    /// True while the orchestrator is re-reading recorded steps
    pub fn is_replaying(&self) -> bool {
        self.record.history.iter().any(|entry| entry.seq >= self.next_seq)
    }

    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn into_record(self) -> InstanceRecord {
        self.record
    }

    /// Record an orchestration milestone; the phase is persisted with the next checkpoint
    pub fn advance(&mut self, milestone: Milestone) -> Result<OnboardingPhase, WorkflowError> {
        let phase = self.progress.advance(milestone)?;
        self.record.phase = phase;
        Ok(phase)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    async fn checkpoint(&mut self, reason: CheckpointReason) -> Result<(), WorkflowError> {
        self.record.updated_at = Utc::now();
        let checkpoint_id = self.services.history.save_instance(&self.record, reason).await?;
        debug!(
            instance_id = %self.record.instance_id,
            checkpoint_id = %checkpoint_id,
            reason = ?reason,
            "Checkpoint recorded"
        );
        Ok(())
    }

    /// Invoke an activity, or return its recorded outcome on replay
    pub async fn call_activity<T: DeserializeOwned>(
        &mut self,
        call: ActivityCall,
    ) -> Result<T, WorkflowError> {
        let seq = self.take_seq();
        let kind = call.kind();

        if let Some(entry) = self.record.entries_at(seq).next() {
            return match &entry.event {
                HistoryEvent::ActivityCompleted {
                    activity, output, ..
                } if *activity == kind => {
                    self.services.metrics.record_activity_replay();
                    debug!(
                        instance_id = %self.record.instance_id,
                        seq,
                        activity = %kind,
                        "Replaying activity result"
                    );
                    Ok(serde_json::from_value(output.clone())?)
                }
                HistoryEvent::ActivityFailed {
                    activity, error, ..
                } if *activity == kind => {
                    self.services.metrics.record_activity_replay();
                    Err(WorkflowError::ActivityFailed {
                        activity: kind,
                        message: error.clone(),
                    })
                }
                other => Err(WorkflowError::NonDeterminism {
                    seq,
                    recorded: other.describe(),
                    requested: kind.to_string(),
                }),
            };
        }

        let input = call.input_json()?;
        let result = {
            let _permit = self
                .services
                .activity_slots
                .acquire()
                .await
                .map_err(|_| WorkflowError::ActivityPoolClosed)?;
            let timer = OperationTimer::new(kind.name());
            let result = call.dispatch(self.services.activities.as_ref()).await;
            timer.finish();
            result
        };
        self.services.metrics.record_activity_execution();

        match result {
            Ok(output) => {
                self.record.append(
                    seq,
                    HistoryEvent::ActivityCompleted {
                        activity: kind,
                        input,
                        output: output.clone(),
                    },
                );
                self.checkpoint(CheckpointReason::ActivityRecorded).await?;
                Ok(serde_json::from_value(output)?)
            }
            Err(e) => {
                self.services.metrics.record_activity_failure();
                warn!(
                    instance_id = %self.record.instance_id,
                    seq,
                    activity = %kind,
                    error = %e,
                    "Activity failed"
                );
                let message = e.to_string();
                self.record.append(
                    seq,
                    HistoryEvent::ActivityFailed {
                        activity: kind,
                        input,
                        error: message.clone(),
                    },
                );
                self.checkpoint(CheckpointReason::ActivityRecorded).await?;
                Err(WorkflowError::ActivityFailed {
                    activity: kind,
                    message,
                })
            }
        }
    }

    /// Send a notification whose failure is logged and otherwise ignored
    pub async fn notify(&mut self, message: impl Into<String>) -> Result<(), WorkflowError> {
        match self
            .call_activity::<()>(ActivityCall::Notify(Notification::new(message)))
            .await
        {
            Ok(()) => Ok(()),
            Err(WorkflowError::ActivityFailed { message, .. }) => {
                warn!(
                    instance_id = %self.record.instance_id,
                    error = %message,
                    "Failed to send notification"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Suspend until the named event is raised for this instance or the
    /// timeout elapses. The deadline is recorded, so a resumed instance waits
    /// only for what remains of it.
    pub async fn wait_for_external_event(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, WorkflowError> {
        let seq = self.take_seq();
        let timeout_secs = timeout.as_secs();

        let mut recorded_deadline = None;
        for entry in self.record.entries_at(seq) {
            match &entry.event {
                HistoryEvent::EventReceived {
                    name: recorded,
                    payload,
                    ..
                } if recorded == name => return Ok(payload.clone()),
                HistoryEvent::EventTimedOut { name: recorded } if recorded == name => {
                    return Err(WorkflowError::EventTimeout {
                        name: name.to_string(),
                        timeout_secs,
                    });
                }
                HistoryEvent::EventWaitStarted {
                    name: recorded,
                    deadline,
                } if recorded == name => recorded_deadline = Some(*deadline),
                other => {
                    return Err(WorkflowError::NonDeterminism {
                        seq,
                        recorded: other.describe(),
                        requested: format!("event '{name}'"),
                    });
                }
            }
        }

        let (deadline, wall_deadline) = match recorded_deadline {
            Some(wall_deadline) => {
                let remaining = (wall_deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                (Instant::now() + remaining, wall_deadline)
            }
            None => {
                let wall_deadline = chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|timeout| Utc::now().checked_add_signed(timeout))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.record.append(
                    seq,
                    HistoryEvent::EventWaitStarted {
                        name: name.to_string(),
                        deadline: wall_deadline,
                    },
                );
                self.checkpoint(CheckpointReason::EventWaitStarted).await?;
                (Instant::now() + timeout, wall_deadline)
            }
        };

        info!(
            instance_id = %self.record.instance_id,
            event = %name,
            deadline = %wall_deadline,
            "Waiting for external event"
        );

        let mailbox = self
            .services
            .events
            .mailbox(&self.record.instance_id, name)
            .await;

        loop {
            let pending = self
                .services
                .history
                .pending_inbox(&self.record.instance_id)
                .await?;
            if let Some(event) = pending
                .into_iter()
                .find(|event| event.name == name && event.raised_at <= wall_deadline)
            {
                self.record.append(
                    seq,
                    HistoryEvent::EventReceived {
                        name: name.to_string(),
                        inbox_id: event.id.clone(),
                        payload: event.payload.clone(),
                    },
                );
                self.checkpoint(CheckpointReason::EventRecorded).await?;
                self.services
                    .history
                    .remove_inbox(&self.record.instance_id, &event.id)
                    .await?;

                info!(
                    instance_id = %self.record.instance_id,
                    event = %name,
                    "External event received"
                );
                return Ok(event.payload);
            }

            let now = Instant::now();
            if now >= deadline {
                self.record.append(
                    seq,
                    HistoryEvent::EventTimedOut {
                        name: name.to_string(),
                    },
                );
                self.checkpoint(CheckpointReason::EventRecorded).await?;
                self.services.metrics.record_approval_timeout();

                warn!(
                    instance_id = %self.record.instance_id,
                    event = %name,
                    timeout_secs,
                    "Timed out waiting for external event"
                );
                return Err(WorkflowError::EventTimeout {
                    name: name.to_string(),
                    timeout_secs,
                });
            }

            let poll = (deadline - now).min(self.services.inbox_poll_interval);
            tokio::select! {
                _ = mailbox.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
