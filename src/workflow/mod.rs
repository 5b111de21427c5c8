//! Durable execution of the onboarding workflow.
//!
//! An instance is an ordered history of recorded steps. The orchestrator body
//! is re-run from the start of that history after every restart; each
//! [`WorkflowContext`] call first looks for a recorded outcome at its sequence
//! position and only performs the work when none exists.

pub mod context;
pub mod events;
pub mod history;
pub mod orchestrator;
pub mod persistence;
pub mod progress;

pub use context::WorkflowContext;
pub use events::EventHub;
pub use history::{HistoryEntry, HistoryEvent, InboxEvent, InstanceRecord, RuntimeStatus};
pub use orchestrator::onboarding_workflow;
pub use persistence::{
    CheckpointMetadata, CheckpointReason, FileSystemHistoryStore, HistoryStore,
    InMemoryHistoryStore, PersistenceError,
};
pub use progress::{Milestone, OnboardingPhase, ProgressTracker};

use thiserror::Error;

use crate::activities::ActivityKind;

/// Errors that end an orchestration run
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{activity} failed: {message}")]
    ActivityFailed {
        activity: ActivityKind,
        message: String,
    },

    #[error("Timed out after {timeout_secs}s waiting for external event '{name}'")]
    EventTimeout { name: String, timeout_secs: u64 },

    #[error("Non-deterministic replay at sequence {seq}: history has {recorded}, orchestrator requested {requested}")]
    NonDeterminism {
        seq: u64,
        recorded: String,
        requested: String,
    },

    #[error("Invalid phase transition from {from:?} on {milestone}")]
    InvalidTransition {
        from: OnboardingPhase,
        milestone: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Activity pool closed")]
    ActivityPoolClosed,
}
