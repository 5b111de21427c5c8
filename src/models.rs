// Onboarding domain payloads
// Field names follow the persisted JSON shapes so records written by other
// onboarding clients stay readable.

use serde::{Deserialize, Serialize};

/// Input payload used to schedule a new onboarding instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingPayload {
    #[serde(rename = "item_name")]
    pub organization: String,
    #[serde(rename = "numofusers")]
    pub num_of_users: u32,
}

impl OnboardingPayload {
    pub fn new(organization: impl Into<String>, num_of_users: u32) -> Self {
        Self {
            organization: organization.into(),
            num_of_users,
        }
    }

    /// Reject payloads that can never be onboarded
    pub fn validate(&self) -> Result<(), String> {
        if self.organization.trim().is_empty() {
            return Err("organization name must not be empty".to_string());
        }
        Ok(())
    }
}

/// Terminal result of one onboarding instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingResult {
    pub processed: bool,
}

impl OnboardingResult {
    pub fn processed() -> Self {
        Self { processed: true }
    }

    pub fn not_processed() -> Self {
        Self { processed: false }
    }
}

/// Organization record owned by the state store.
/// Missing fields read as empty/zero, so partial records written by other clients still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowItem {
    #[serde(rename = "workflow_name", default)]
    pub organization: String,
    #[serde(rename = "numofusers", default)]
    pub num_of_users: i64,
}

impl WorkflowItem {
    pub fn new(organization: impl Into<String>, num_of_users: i64) -> Self {
        Self {
            organization: organization.into(),
            num_of_users,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.organization.is_empty() && self.num_of_users == 0
    }
}

/// Input to the verification activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub request_id: String,
    #[serde(rename = "request_name")]
    pub organization: String,
    #[serde(rename = "numofusers")]
    pub num_of_users: u32,
}

/// Outcome of checking the store against a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    pub workflow_item: WorkflowItem,
}

impl WorkflowResult {
    pub fn accepted(item: WorkflowItem) -> Self {
        Self {
            success: true,
            workflow_item: item,
        }
    }

    pub fn rejected() -> Self {
        Self::default()
    }
}

/// Input to the provisioning and update activities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingRequest {
    pub request_id: String,
    #[serde(rename = "item_being_processed")]
    pub organization: String,
    #[serde(rename = "numofusers")]
    pub num_of_users: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
