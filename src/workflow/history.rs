use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::persistence::CheckpointMetadata;
use super::progress::OnboardingPhase;
use crate::activities::ActivityKind;
use crate::models::{OnboardingPayload, OnboardingResult};

pub const RECORD_VERSION: &str = "1";

/// Host-visible lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl RuntimeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RuntimeStatus::Running)
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeStatus::Running => "RUNNING",
            RuntimeStatus::Completed => "COMPLETED",
            RuntimeStatus::Failed => "FAILED",
            RuntimeStatus::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// One recorded step outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    ActivityCompleted {
        activity: ActivityKind,
        input: serde_json::Value,
        output: serde_json::Value,
    },
    ActivityFailed {
        activity: ActivityKind,
        input: serde_json::Value,
        error: String,
    },
    EventWaitStarted {
        name: String,
        deadline: DateTime<Utc>,
    },
    EventReceived {
        name: String,
        inbox_id: String,
        payload: Option<serde_json::Value>,
    },
    EventTimedOut {
        name: String,
    },
}

impl HistoryEvent {
    /// Short form used in non-determinism reports
    pub fn describe(&self) -> String {
        match self {
            HistoryEvent::ActivityCompleted { activity, .. }
            | HistoryEvent::ActivityFailed { activity, .. } => activity.to_string(),
            HistoryEvent::EventWaitStarted { name, .. }
            | HistoryEvent::EventReceived { name, .. }
            | HistoryEvent::EventTimedOut { name } => format!("event '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// An external event accepted by the host but not yet consumed by a wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: String,
    pub name: String,
    pub payload: Option<serde_json::Value>,
    pub raised_at: DateTime<Utc>,
}

impl InboxEvent {
    pub fn new(name: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            raised_at: Utc::now(),
        }
    }
}

/// Everything the host persists for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub version: String,
    pub instance_id: String,
    pub workflow_name: String,
    pub status: RuntimeStatus,
    pub phase: OnboardingPhase,
    pub input: OnboardingPayload,
    pub output: Option<OnboardingResult>,
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checkpoint: Option<CheckpointMetadata>,
}

impl InstanceRecord {
    pub fn new(
        instance_id: impl Into<String>,
        workflow_name: impl Into<String>,
        input: OnboardingPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: RECORD_VERSION.to_string(),
            instance_id: instance_id.into(),
            workflow_name: workflow_name.into(),
            status: RuntimeStatus::Running,
            phase: OnboardingPhase::Received,
            input,
            output: None,
            error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            checkpoint: None,
        }
    }

    /// Recorded entries at a sequence position, in recording order
    pub fn entries_at(&self, seq: u64) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(move |entry| entry.seq == seq)
    }

    pub fn append(&mut self, seq: u64, event: HistoryEvent) {
        self.history.push(HistoryEntry {
            seq,
            recorded_at: Utc::now(),
            event,
        });
        self.updated_at = Utc::now();
    }

    pub fn finish(
        &mut self,
        status: RuntimeStatus,
        output: OnboardingResult,
        error: Option<String>,
    ) {
        self.status = status;
        self.output = Some(output);
        self.error = error;
        self.updated_at = Utc::now();
    }

    /// Count of completed executions of one activity
    pub fn activity_count(&self, kind: ActivityKind) -> usize {
        self.history
            .iter()
            .filter(|entry| {
                matches!(
                    &entry.event,
                    HistoryEvent::ActivityCompleted { activity, .. }
                        | HistoryEvent::ActivityFailed { activity, .. } if *activity == kind
                )
            })
            .count()
    }
}
