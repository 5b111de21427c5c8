use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ActivityError, OnboardingActivities};
use crate::config::{PersistedCountPolicy, WorkflowConfig};
use crate::models::{
    ApprovalDecision, Notification, OnboardingPayload, OnboardingRequest, VerificationRequest,
    WorkflowResult,
};
use crate::state_store::{read_item, write_item, StateStore};

/// Activities backed by the organization state store
pub struct OnboardingActivityExecutor {
    store: Arc<dyn StateStore>,
    store_name: String,
    persisted_count: PersistedCountPolicy,
}

impl std::fmt::Debug for OnboardingActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnboardingActivityExecutor")
            .field("store_name", &self.store_name)
            .field("persisted_count", &self.persisted_count)
            .finish()
    }
}

impl OnboardingActivityExecutor {
    pub fn new(store: Arc<dyn StateStore>, workflow: &WorkflowConfig) -> Self {
        Self {
            store,
            store_name: "statestore".to_string(),
            persisted_count: workflow.persisted_count,
        }
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }
}

#[async_trait]
impl OnboardingActivities for OnboardingActivityExecutor {
    async fn notify(&self, notification: Notification) -> Result<(), ActivityError> {
        info!(message = %notification.message, "NotifyActivity");
        Ok(())
    }

    async fn verify_onboarding(
        &self,
        request: VerificationRequest,
    ) -> Result<WorkflowResult, ActivityError> {
        info!(
            request_id = %request.request_id,
            organization = %request.organization,
            num_of_users = request.num_of_users,
            store = %self.store_name,
            "VerifyOnboardingActivity: verifying request"
        );

        let Some(item) = read_item(self.store.as_ref(), &request.organization).await? else {
            info!(
                organization = %request.organization,
                "VerifyOnboardingActivity: no onboarding record found"
            );
            return Ok(WorkflowResult::rejected());
        };

        if item.num_of_users >= i64::from(request.num_of_users) {
            info!(
                organization = %item.organization,
                num_of_users = item.num_of_users,
                "VerifyOnboardingActivity: onboarding request is ready for processing"
            );
            Ok(WorkflowResult::accepted(item))
        } else {
            info!(
                organization = %item.organization,
                stored = item.num_of_users,
                requested = request.num_of_users,
                "VerifyOnboardingActivity: stored user count is below the request"
            );
            Ok(WorkflowResult::rejected())
        }
    }

    async fn request_approval(
        &self,
        payload: OnboardingPayload,
    ) -> Result<ApprovalDecision, ActivityError> {
        // Approval is granted here; the manager sign-off arrives as an external event.
        info!(
            organization = %payload.organization,
            num_of_users = payload.num_of_users,
            "RequestApprovalActivity: requesting approval for onboarding"
        );
        Ok(ApprovalDecision { approval: true })
    }

    async fn process_add_user(&self, request: OnboardingRequest) -> Result<(), ActivityError> {
        info!(
            request_id = %request.request_id,
            organization = %request.organization,
            num_of_users = request.num_of_users,
            "ProcessAddUserActivity: adding users to organization"
        );
        Ok(())
    }

    /// With `PersistedCountPolicy::Requested` a re-run after the write sees the
    /// requested count and writes it again, so the activity is idempotent.
    /// `Remaining` subtracts again on every re-run.
    async fn update_onboarding(
        &self,
        request: OnboardingRequest,
    ) -> Result<WorkflowResult, ActivityError> {
        info!(
            request_id = %request.request_id,
            organization = %request.organization,
            num_of_users = request.num_of_users,
            "UpdateOnboardingActivity: checking request"
        );

        let Some(mut item) = read_item(self.store.as_ref(), &request.organization).await? else {
            return Err(ActivityError::RecordNotFound {
                organization: request.organization,
            });
        };

        let requested = i64::from(request.num_of_users);
        let remaining = item.num_of_users - requested;
        if remaining < 0 {
            warn!(
                organization = %request.organization,
                stored = item.num_of_users,
                requested,
                "UpdateOnboardingActivity: stored user count exhausted"
            );
            return Err(ActivityError::InsufficientUsers {
                organization: request.organization,
            });
        }

        item.num_of_users = match self.persisted_count {
            PersistedCountPolicy::Requested => requested,
            PersistedCountPolicy::Remaining => remaining,
        };
        write_item(self.store.as_ref(), &request.organization, &item).await?;

        info!(
            organization = %item.organization,
            num_of_users = item.num_of_users,
            policy = ?self.persisted_count,
            "UpdateOnboardingActivity: organization record updated"
        );
        Ok(WorkflowResult::accepted(item))
    }
}
