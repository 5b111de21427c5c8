//! Restart continuity tests
//!
//! These tests stop a host part-way through an instance and bring up a new
//! host over the same history directory, checking that recorded steps are
//! replayed rather than re-executed and that damaged histories are terminated
//! instead of replayed.

mod fixtures;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use fixtures::{file_host, memory_host, wait_for_phase, RecordingActivities};
use onboarding_orchestrator::workflow::context::HostServices;
use onboarding_orchestrator::workflow::{CheckpointReason, EventHub, HistoryEvent, InstanceRecord};
use onboarding_orchestrator::{
    onboarding_workflow, ActivityKind, FileSystemHistoryStore, HistoryStore, InMemoryHistoryStore,
    OnboardingPayload, OnboardingPhase, OnboardingResult, RuntimeStatus, WorkflowConfig,
    WorkflowContext, WorkflowMetrics,
};

const COMPLETION_WAIT: Duration = Duration::from_secs(10);

/// Run an instance on a first host until it is parked at the approval gate,
/// then stop that host
async fn park_at_approval_gate(
    directory: &TempDir,
    instance_id: &str,
) -> Result<Arc<RecordingActivities>> {
    let activities = RecordingActivities::new();
    activities.seed("Acme", 100).await?;

    let host = file_host(activities.clone(), directory.path());
    host.schedule_new_workflow_with_id(instance_id, OnboardingPayload::new("Acme", 60))
        .await?;
    wait_for_phase(&host, instance_id, OnboardingPhase::ApprovalPending).await?;
    host.shutdown().await;

    Ok(activities)
}

#[tokio::test]
async fn test_resumed_instance_replays_recorded_steps() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let first_run = park_at_approval_gate(&temp_dir, "onboarding-restart").await?;
    assert_eq!(first_run.count(ActivityKind::VerifyOnboarding), 1);
    assert_eq!(first_run.count(ActivityKind::RequestApproval), 1);

    let second_run = RecordingActivities::with_store(first_run.store().clone());
    let host = file_host(second_run.clone(), temp_dir.path());

    let status = host.fetch_workflow_metadata("onboarding-restart").await?;
    assert_eq!(status.runtime_status, RuntimeStatus::Running);
    assert_eq!(status.phase, OnboardingPhase::ApprovalPending);

    let report = host.resume_incomplete().await?;
    assert_eq!(report.resumed, vec!["onboarding-restart".to_string()]);
    assert!(report.terminated.is_empty());

    host.raise_event("onboarding-restart", "manager_approval", None)
        .await?;
    let metadata = host
        .wait_for_completion("onboarding-restart", COMPLETION_WAIT)
        .await?;

    assert_eq!(metadata.runtime_status, RuntimeStatus::Completed);
    assert_eq!(metadata.output, Some(OnboardingResult::processed()));

    // Steps recorded before the restart are not executed again
    assert_eq!(second_run.count(ActivityKind::VerifyOnboarding), 0);
    assert_eq!(second_run.count(ActivityKind::RequestApproval), 0);
    assert_eq!(second_run.count(ActivityKind::ProcessAddUser), 1);
    assert_eq!(second_run.count(ActivityKind::UpdateOnboarding), 1);
    assert!(!second_run
        .notifications()
        .iter()
        .any(|message| message.starts_with("Received onboarding request")));

    let stats = host.metrics().get_stats();
    assert!(stats.activity_replays >= 3);
    Ok(())
}

#[tokio::test]
async fn test_approval_raised_while_host_is_down_is_delivered_on_resume() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let first_run = park_at_approval_gate(&temp_dir, "onboarding-offline").await?;

    // An approval raised from a separate process lands in the persisted inbox
    let approver = file_host(RecordingActivities::new(), temp_dir.path());
    approver
        .raise_event("onboarding-offline", "manager_approval", None)
        .await?;
    assert_eq!(approver.active_instances().await, 0);

    let second_run = RecordingActivities::with_store(first_run.store().clone());
    let host = file_host(second_run.clone(), temp_dir.path());
    host.resume_incomplete().await?;

    let metadata = host
        .wait_for_completion("onboarding-offline", COMPLETION_WAIT)
        .await?;
    assert_eq!(metadata.output, Some(OnboardingResult::processed()));
    assert_eq!(second_run.count(ActivityKind::RequestApproval), 0);

    let history = FileSystemHistoryStore::new(temp_dir.path(), true);
    assert!(history.pending_inbox("onboarding-offline").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tampered_history_is_terminated_not_replayed() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let history = FileSystemHistoryStore::new(temp_dir.path(), true);
    let record = InstanceRecord::new(
        "onboarding-tampered",
        "ProcessWorkflow",
        OnboardingPayload::new("Acme", 3),
    );
    history
        .save_instance(&record, CheckpointReason::Scheduled)
        .await?;

    let record_file = temp_dir.path().join("onboarding-tampered.instance.json");
    let mut contents: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&record_file).await?)?;
    contents["input"]["numofusers"] = serde_json::json!(3000);
    tokio::fs::write(&record_file, serde_json::to_string_pretty(&contents)?).await?;

    let activities = RecordingActivities::new();
    let host = file_host(activities.clone(), temp_dir.path());
    let report = host.resume_incomplete().await?;

    assert!(report.resumed.is_empty());
    assert_eq!(report.terminated, vec!["onboarding-tampered".to_string()]);
    assert!(activities.calls().is_empty());

    let metadata = host.fetch_workflow_metadata("onboarding-tampered").await?;
    assert_eq!(metadata.runtime_status, RuntimeStatus::Terminated);
    assert!(metadata
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Integrity check failed")));

    // Terminated instances are not picked up again
    let report = host.resume_incomplete().await?;
    assert!(report.resumed.is_empty());
    assert!(report.terminated.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_diverging_history_fails_instance() -> Result<()> {
    let activities = RecordingActivities::new();
    let (host, history) = memory_host(activities.clone());

    let mut record = InstanceRecord::new(
        "onboarding-diverged",
        "ProcessWorkflow",
        OnboardingPayload::new("Acme", 3),
    );
    record.append(
        0,
        HistoryEvent::ActivityCompleted {
            activity: ActivityKind::VerifyOnboarding,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
        },
    );
    history
        .save_instance(&record, CheckpointReason::Scheduled)
        .await?;

    host.resume_incomplete().await?;
    let metadata = host
        .wait_for_completion("onboarding-diverged", COMPLETION_WAIT)
        .await?;

    assert_eq!(metadata.runtime_status, RuntimeStatus::Failed);
    assert!(metadata
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Non-deterministic replay at sequence 0")));
    assert!(activities.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_replaying_finished_history_reproduces_outcome() -> Result<()> {
    let activities = RecordingActivities::new();
    let (host, history) = memory_host(activities.clone());

    let cases = [
        ("onboarding-small", "Small", 3u32, true),
        ("onboarding-approved", "Large", 60, true),
        ("onboarding-declined", "Declined", 60, false),
        ("onboarding-unknown", "Nobody", 5, true),
    ];
    for (instance_id, organization, users, approval) in cases {
        if organization != "Nobody" {
            activities.seed(organization, 100).await?;
        }
        activities.set_approval(approval);
        host.schedule_new_workflow_with_id(instance_id, OnboardingPayload::new(organization, users))
            .await?;
        host.raise_event(instance_id, "manager_approval", None)
            .await?;
        host.wait_for_completion(instance_id, COMPLETION_WAIT).await?;
    }

    for (instance_id, ..) in cases {
        let record = history
            .load_instance(instance_id)
            .await?
            .expect("finished instance is persisted");
        let expected = record.output;
        let payload = record.input.clone();

        let replay_activities = RecordingActivities::new();
        let services = HostServices {
            activities: replay_activities.clone(),
            history: Arc::new(InMemoryHistoryStore::new()),
            events: EventHub::new(),
            activity_slots: Arc::new(Semaphore::new(1)),
            metrics: Arc::new(WorkflowMetrics::new()),
            inbox_poll_interval: Duration::from_millis(10),
        };
        let mut ctx = WorkflowContext::new(record, WorkflowConfig::default(), services);
        let outcome = onboarding_workflow(&mut ctx, payload).await?;

        assert_eq!(Some(outcome), expected, "{instance_id}");
        assert!(replay_activities.calls().is_empty(), "{instance_id}");
        assert!(!ctx.is_replaying());
    }
    Ok(())
}
