//! Activity executors invoked by the onboarding orchestrator.
//!
//! The activity set is closed: [`OnboardingActivities`] names every unit of
//! work and [`ActivityCall`] is the typed dispatch table the workflow context
//! uses to invoke one and record its JSON result in the instance history.
//! Activities may run more than once per logical call (a crash between the
//! side effect and the checkpoint re-runs it on resume), so each
//! implementation must be idempotent or side-effect free.

pub mod onboarding;

pub use onboarding::OnboardingActivityExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{
    ApprovalDecision, Notification, OnboardingPayload, OnboardingRequest, VerificationRequest,
    WorkflowResult,
};
use crate::state_store::StateStoreError;

/// Errors returned by activity executors
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("No onboarding record found for: {organization}")]
    RecordNotFound { organization: String },

    #[error("incorrect number of organizations being onboarded for: {organization}")]
    InsufficientUsers { organization: String },

    #[error("Invalid activity input: {reason}")]
    InvalidInput { reason: String },

    #[error("Activity failed: {reason}")]
    Failed { reason: String },
}

/// Identifies an activity in logs and in the instance history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    Notify,
    VerifyOnboarding,
    RequestApproval,
    ProcessAddUser,
    UpdateOnboarding,
}

impl ActivityKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActivityKind::Notify => "NotifyActivity",
            ActivityKind::VerifyOnboarding => "VerifyOnboardingActivity",
            ActivityKind::RequestApproval => "RequestApprovalActivity",
            ActivityKind::ProcessAddUser => "ProcessAddUserActivity",
            ActivityKind::UpdateOnboarding => "UpdateOnboardingActivity",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The onboarding units of work
#[async_trait]
pub trait OnboardingActivities: Send + Sync {
    /// Emit a human-readable status message
    async fn notify(&self, notification: Notification) -> Result<(), ActivityError>;

    /// Check the stored organization record against the requested user count
    async fn verify_onboarding(
        &self,
        request: VerificationRequest,
    ) -> Result<WorkflowResult, ActivityError>;

    /// Decide whether a large request is approved
    async fn request_approval(
        &self,
        payload: OnboardingPayload,
    ) -> Result<ApprovalDecision, ActivityError>;

    /// Provision the requested users
    async fn process_add_user(&self, request: OnboardingRequest) -> Result<(), ActivityError>;

    /// Validate the request against the stored count and write the record back
    async fn update_onboarding(
        &self,
        request: OnboardingRequest,
    ) -> Result<WorkflowResult, ActivityError>;
}

/// One activity invocation with its typed input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityCall {
    Notify(Notification),
    VerifyOnboarding(VerificationRequest),
    RequestApproval(OnboardingPayload),
    ProcessAddUser(OnboardingRequest),
    UpdateOnboarding(OnboardingRequest),
}

impl ActivityCall {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityCall::Notify(_) => ActivityKind::Notify,
            ActivityCall::VerifyOnboarding(_) => ActivityKind::VerifyOnboarding,
            ActivityCall::RequestApproval(_) => ActivityKind::RequestApproval,
            ActivityCall::ProcessAddUser(_) => ActivityKind::ProcessAddUser,
            ActivityCall::UpdateOnboarding(_) => ActivityKind::UpdateOnboarding,
        }
    }

    /// Input as recorded in the instance history
    pub fn input_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ActivityCall::Notify(input) => serde_json::to_value(input),
            ActivityCall::VerifyOnboarding(input) => serde_json::to_value(input),
            ActivityCall::RequestApproval(input) => serde_json::to_value(input),
            ActivityCall::ProcessAddUser(input) => serde_json::to_value(input),
            ActivityCall::UpdateOnboarding(input) => serde_json::to_value(input),
        }
    }

    /// Run the activity and encode its output as JSON
    pub async fn dispatch(
        self,
        activities: &dyn OnboardingActivities,
    ) -> Result<serde_json::Value, ActivityError> {
        let output = match self {
            ActivityCall::Notify(input) => {
                activities.notify(input).await?;
                serde_json::Value::Null
            }
            ActivityCall::VerifyOnboarding(input) => {
                encode(activities.verify_onboarding(input).await?)?
            }
            ActivityCall::RequestApproval(input) => {
                encode(activities.request_approval(input).await?)?
            }
            ActivityCall::ProcessAddUser(input) => {
                activities.process_add_user(input).await?;
                serde_json::Value::Null
            }
            ActivityCall::UpdateOnboarding(input) => {
                encode(activities.update_onboarding(input).await?)?
            }
        };
        Ok(output)
    }
}

fn encode<T: Serialize>(value: T) -> Result<serde_json::Value, ActivityError> {
    serde_json::to_value(value).map_err(|e| ActivityError::Failed {
        reason: format!("activity output could not be encoded: {e}"),
    })
}
