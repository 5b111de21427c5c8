// Onboarding Orchestrator Library - durable organization onboarding workflow
// This exposes the core components for testing and integration

pub mod activities;
pub mod config;
pub mod host;
pub mod models;
pub mod observability;
pub mod shutdown;
pub mod state_store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use activities::{
    ActivityCall, ActivityError, ActivityKind, OnboardingActivities, OnboardingActivityExecutor,
};
pub use config::{OrchestratorConfig, PersistedCountPolicy, WorkflowConfig};
pub use host::{HostError, InstanceMetadata, ResumeReport, WorkflowHost};
pub use models::{
    ApprovalDecision, Notification, OnboardingPayload, OnboardingRequest, OnboardingResult,
    VerificationRequest, WorkflowItem, WorkflowResult,
};
pub use observability::{OperationTimer, WorkflowMetrics, WorkflowStats};
pub use shutdown::ShutdownCoordinator;
pub use state_store::{
    open_store, read_item, remove_item, seed_organization, write_item, FileStateStore,
    InMemoryStateStore, StateStore, StateStoreError, StoreKey,
};
pub use telemetry::{create_instance_span, generate_instance_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    onboarding_workflow, FileSystemHistoryStore, HistoryStore, InMemoryHistoryStore,
    OnboardingPhase, RuntimeStatus, WorkflowContext, WorkflowError,
};
