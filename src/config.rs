use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for the onboarding orchestrator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Onboarding workflow settings
    pub workflow: WorkflowConfig,
    /// State store settings
    pub state_store: StateStoreConfig,
    /// Instance history persistence settings
    pub persistence: HistoryPersistenceConfig,
    /// Host runtime settings
    pub host: HostConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Name the onboarding workflow is registered under
    pub workflow_name: String,
    /// Requests above this user count need manager approval
    pub approval_threshold: u32,
    /// External event that resumes a suspended approval gate
    pub approval_event_name: String,
    /// Maximum wait for the approval event
    pub approval_timeout_seconds: u64,
    /// Which user count UpdateOnboarding writes back to the store
    pub persisted_count: PersistedCountPolicy,
}

/// Value written to the store once an update has been validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedCountPolicy {
    /// Requested count overwrites the stored count
    #[default]
    Requested,
    /// Stored count minus requested count
    Remaining,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateStoreConfig {
    /// Logical store name, used in log fields
    pub store_name: String,
    /// JSON file backing the store; in-memory when absent
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryPersistenceConfig {
    /// Directory holding one history file per instance; in-memory when absent
    pub directory: Option<PathBuf>,
    /// Verify the integrity hash when loading an instance
    pub enable_integrity_checks: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Upper bound on activities executing at once across all instances
    pub max_concurrent_activities: usize,
    /// Interval between status polls while waiting for completion
    pub status_poll_interval_ms: u64,
    /// Interval at which running instances check their persisted inbox
    pub inbox_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON formatted logs
    pub json_logs: bool,
}

impl WorkflowConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    pub fn requires_approval(&self, num_of_users: u32) -> bool {
        num_of_users > self.approval_threshold
    }
}

impl HostConfig {
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn inbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.inbox_poll_interval_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflow_name: "ProcessWorkflow".to_string(),
            approval_threshold: 50,
            approval_event_name: "manager_approval".to_string(),
            approval_timeout_seconds: 200,
            persisted_count: PersistedCountPolicy::Requested,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            state_store: StateStoreConfig {
                store_name: "statestore".to_string(),
                file_path: None,
            },
            persistence: HistoryPersistenceConfig {
                directory: None,
                enable_integrity_checks: true,
            },
            host: HostConfig {
                max_concurrent_activities: 16,
                status_poll_interval_ms: 1000,
                inbox_poll_interval_ms: 1000,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
            },
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (onboarding.toml, .onboarding-rc)
    /// 3. Environment variables (prefixed with ONBOARDING_, nested keys split on `__`)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("onboarding.toml").exists() {
            builder = builder.add_source(File::with_name("onboarding"));
        }

        if Path::new(".onboarding-rc").exists() {
            builder = builder.add_source(File::with_name(".onboarding-rc"));
        }

        builder = builder.add_source(
            Environment::with_prefix("ONBOARDING")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let orchestrator_config: OrchestratorConfig = config.try_deserialize()?;

        tracing::debug!(config = ?orchestrator_config, "Configuration loaded");
        Ok(orchestrator_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
