//! Shared fixtures for the onboarding integration tests
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use onboarding_orchestrator::config::HostConfig;
use onboarding_orchestrator::{
    seed_organization, ActivityError, ActivityKind, ApprovalDecision, FileSystemHistoryStore,
    HistoryStore, InMemoryHistoryStore, InMemoryStateStore, InstanceMetadata, Notification,
    OnboardingActivities, OnboardingActivityExecutor, OnboardingPayload, OnboardingPhase,
    OnboardingRequest, VerificationRequest, WorkflowConfig, WorkflowHost, WorkflowItem,
    WorkflowResult,
};

/// Store-backed activities that record every invocation.
///
/// Verification and update run against a real [`InMemoryStateStore`], so
/// scenarios exercise the production rules. Individual activities can be made
/// to fail, and the approval decision can be flipped.
pub struct RecordingActivities {
    store: InMemoryStateStore,
    executor: OnboardingActivityExecutor,
    calls: Mutex<Vec<ActivityKind>>,
    notifications: Mutex<Vec<String>>,
    failing: Mutex<HashSet<ActivityKind>>,
    approval: AtomicBool,
    accept_all_verifications: AtomicBool,
}

impl RecordingActivities {
    pub fn new() -> Arc<Self> {
        Self::with_store(InMemoryStateStore::new())
    }

    /// Activities over an existing store, e.g. to survive a simulated restart
    pub fn with_store(store: InMemoryStateStore) -> Arc<Self> {
        let executor =
            OnboardingActivityExecutor::new(Arc::new(store.clone()), &WorkflowConfig::default());
        Arc::new(Self {
            store,
            executor,
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            approval: AtomicBool::new(true),
            accept_all_verifications: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &InMemoryStateStore {
        &self.store
    }

    pub async fn seed(&self, organization: &str, num_of_users: i64) -> Result<()> {
        seed_organization(&self.store, &WorkflowItem::new(organization, num_of_users)).await?;
        Ok(())
    }

    pub fn fail(&self, kind: ActivityKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn set_approval(&self, approval: bool) {
        self.approval.store(approval, Ordering::SeqCst);
    }

    /// Verification succeeds regardless of the stored record
    pub fn accept_all_verifications(&self) {
        self.accept_all_verifications.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ActivityKind> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: ActivityKind) -> usize {
        self.calls().iter().filter(|call| **call == kind).count()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }

    fn record(&self, kind: ActivityKind) -> Result<(), ActivityError> {
        self.calls.lock().unwrap().push(kind);
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(ActivityError::Failed {
                reason: format!("{kind} unavailable"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OnboardingActivities for RecordingActivities {
    async fn notify(&self, notification: Notification) -> Result<(), ActivityError> {
        self.record(ActivityKind::Notify)?;
        self.notifications
            .lock()
            .unwrap()
            .push(notification.message);
        Ok(())
    }

    async fn verify_onboarding(
        &self,
        request: VerificationRequest,
    ) -> Result<WorkflowResult, ActivityError> {
        self.record(ActivityKind::VerifyOnboarding)?;
        if self.accept_all_verifications.load(Ordering::SeqCst) {
            return Ok(WorkflowResult::accepted(WorkflowItem::new(
                &request.organization,
                i64::from(request.num_of_users),
            )));
        }
        self.executor.verify_onboarding(request).await
    }

    async fn request_approval(
        &self,
        _payload: OnboardingPayload,
    ) -> Result<ApprovalDecision, ActivityError> {
        self.record(ActivityKind::RequestApproval)?;
        Ok(ApprovalDecision {
            approval: self.approval.load(Ordering::SeqCst),
        })
    }

    async fn process_add_user(&self, request: OnboardingRequest) -> Result<(), ActivityError> {
        self.record(ActivityKind::ProcessAddUser)?;
        self.executor.process_add_user(request).await
    }

    async fn update_onboarding(
        &self,
        request: OnboardingRequest,
    ) -> Result<WorkflowResult, ActivityError> {
        self.record(ActivityKind::UpdateOnboarding)?;
        self.executor.update_onboarding(request).await
    }
}

/// Host settings with short poll intervals
pub fn fast_host_config() -> HostConfig {
    HostConfig {
        max_concurrent_activities: 4,
        status_poll_interval_ms: 10,
        inbox_poll_interval_ms: 20,
    }
}

pub fn memory_host(activities: Arc<RecordingActivities>) -> (WorkflowHost, InMemoryHistoryStore) {
    let history = InMemoryHistoryStore::new();
    let host = WorkflowHost::new(
        WorkflowConfig::default(),
        &fast_host_config(),
        activities,
        Arc::new(history.clone()),
    );
    (host, history)
}

pub fn file_host(activities: Arc<RecordingActivities>, directory: &Path) -> WorkflowHost {
    let history: Arc<dyn HistoryStore> = Arc::new(FileSystemHistoryStore::new(directory, true));
    WorkflowHost::new(
        WorkflowConfig::default(),
        &fast_host_config(),
        activities,
        history,
    )
}

/// Poll until the instance reports `phase`
pub async fn wait_for_phase(
    host: &WorkflowHost,
    instance_id: &str,
    phase: OnboardingPhase,
) -> Result<InstanceMetadata> {
    for _ in 0..500 {
        let metadata = host.fetch_workflow_metadata(instance_id).await?;
        if metadata.phase == phase {
            return Ok(metadata);
        }
        if metadata.runtime_status.is_terminal() {
            bail!(
                "instance {instance_id} finished as {} in phase {:?} before reaching {phase:?}",
                metadata.runtime_status,
                metadata.phase
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("instance {instance_id} never reached {phase:?}")
}
