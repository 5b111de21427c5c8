use tracing::{info, warn};

use super::context::WorkflowContext;
use super::progress::Milestone;
use super::WorkflowError;
use crate::activities::ActivityCall;
use crate::models::{
    ApprovalDecision, OnboardingPayload, OnboardingRequest, OnboardingResult,
    VerificationRequest, WorkflowResult,
};

/// The onboarding orchestration.
///
/// Every side effect goes through `ctx`, so re-running this function over a
/// recorded history reproduces the same decisions without repeating work.
/// Business rejections end with `{processed: false}`; errors end the instance
/// as failed.
pub async fn onboarding_workflow(
    ctx: &mut WorkflowContext,
    payload: OnboardingPayload,
) -> Result<OnboardingResult, WorkflowError> {
    match run_onboarding(ctx, &payload).await {
        Ok(result) => Ok(result),
        Err(e) => {
            if !ctx.phase().is_terminal() {
                ctx.advance(Milestone::Failed)?;
            }
            Err(e)
        }
    }
}

async fn run_onboarding(
    ctx: &mut WorkflowContext,
    payload: &OnboardingPayload,
) -> Result<OnboardingResult, WorkflowError> {
    let onboarding_id = ctx.instance_id().to_string();
    let organization = payload.organization.clone();
    let num_of_users = payload.num_of_users;

    ctx.notify(format!(
        "Received onboarding request {onboarding_id} for new organization {organization} with {num_of_users} users"
    ))
    .await?;

    ctx.advance(Milestone::VerificationStarted)?;
    let verification: WorkflowResult = ctx
        .call_activity(ActivityCall::VerifyOnboarding(VerificationRequest {
            request_id: onboarding_id.clone(),
            organization: organization.clone(),
            num_of_users,
        }))
        .await?;

    if !verification.success {
        ctx.advance(Milestone::VerificationRejected)?;
        ctx.notify(format!(
            "Onboarding request {onboarding_id} rejected: verification failed for {organization}"
        ))
        .await?;
        return Ok(OnboardingResult::not_processed());
    }

    let workflow = ctx.workflow_config().clone();
    let approval_required = workflow.requires_approval(num_of_users);
    ctx.advance(Milestone::Verified { approval_required })?;

    if approval_required {
        let decision: ApprovalDecision = ctx
            .call_activity(ActivityCall::RequestApproval(payload.clone()))
            .await?;
        ctx.advance(Milestone::ApprovalRequested)?;

        ctx.wait_for_external_event(&workflow.approval_event_name, workflow.approval_timeout())
            .await?;

        if decision.approval {
            ctx.advance(Milestone::Approved)?;
            ctx.notify(format!(
                "Onboarding for request {onboarding_id} has been approved!"
            ))
            .await?;
        } else {
            ctx.advance(Milestone::Disapproved)?;
            ctx.notify(format!(
                "Onboarding for request {onboarding_id} has been rejected!"
            ))
            .await?;
            info!(instance_id = %onboarding_id, "Onboarding disapproved");
            return Ok(OnboardingResult::not_processed());
        }
    }

    let request = OnboardingRequest {
        request_id: onboarding_id.clone(),
        organization,
        num_of_users,
    };

    if let Err(e) = ctx
        .call_activity::<()>(ActivityCall::ProcessAddUser(request.clone()))
        .await
    {
        return fail_with_notification(ctx, &onboarding_id, e).await;
    }
    ctx.advance(Milestone::Provisioned)?;

    if let Err(e) = ctx
        .call_activity::<WorkflowResult>(ActivityCall::UpdateOnboarding(request))
        .await
    {
        return fail_with_notification(ctx, &onboarding_id, e).await;
    }
    ctx.advance(Milestone::Updated)?;

    ctx.notify(format!("Onboarding {onboarding_id} has completed!")).await?;
    Ok(OnboardingResult::processed())
}

/// Report a failed provisioning step, then surface the step's own error
async fn fail_with_notification(
    ctx: &mut WorkflowContext,
    onboarding_id: &str,
    error: WorkflowError,
) -> Result<OnboardingResult, WorkflowError> {
    if !matches!(error, WorkflowError::ActivityFailed { .. }) {
        return Err(error);
    }

    warn!(instance_id = %onboarding_id, error = %error, "Onboarding step failed");
    ctx.notify(format!("Onboarding {onboarding_id} failed!")).await?;
    Err(error)
}
