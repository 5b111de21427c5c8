use async_trait::async_trait;
use chrono::Utc;
use fd_lock::RwLock as FileLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::history::{InboxEvent, InstanceRecord, RuntimeStatus, RECORD_VERSION};

/// Errors that can occur while persisting instance history
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("State corruption detected for instance {instance_id}: {reason}")]
    StateCorruption { instance_id: String, reason: String },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Lock acquisition failed: {reason}")]
    LockError { reason: String },

    #[error("Invalid instance id: {instance_id}")]
    InvalidInstanceId { instance_id: String },

    #[error("Instance not found: {instance_id}")]
    NotFound { instance_id: String },

    #[error("Persistence task failed: {reason}")]
    TaskFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: String,
    pub creation_reason: CheckpointReason,
    pub integrity_hash: String,
    pub host_pid: Option<u32>,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointReason {
    Scheduled,
    ActivityRecorded,
    EventWaitStarted,
    EventRecorded,
    Finished,
    Terminated,
}

/// Durable storage for instance records and their event inboxes
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist the record, returning the new checkpoint id
    async fn save_instance(
        &self,
        record: &InstanceRecord,
        reason: CheckpointReason,
    ) -> Result<String, PersistenceError>;

    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, PersistenceError>;

    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError>;

    /// Force a stored record into `Terminated`, bypassing integrity checks
    async fn mark_terminated(&self, instance_id: &str, reason: &str)
        -> Result<(), PersistenceError>;

    async fn append_inbox(
        &self,
        instance_id: &str,
        event: InboxEvent,
    ) -> Result<(), PersistenceError>;

    async fn pending_inbox(&self, instance_id: &str) -> Result<Vec<InboxEvent>, PersistenceError>;

    async fn remove_inbox(&self, instance_id: &str, event_id: &str)
        -> Result<(), PersistenceError>;

    /// Drop every pending event of a finished instance, returning how many were discarded
    async fn clear_inbox(&self, instance_id: &str) -> Result<usize, PersistenceError>;
}

fn validate_instance_id(instance_id: &str) -> Result<(), PersistenceError> {
    let invalid = instance_id.is_empty()
        || instance_id.contains(['/', '\\'])
        || instance_id.contains("..");
    if invalid {
        return Err(PersistenceError::InvalidInstanceId {
            instance_id: instance_id.to_string(),
        });
    }
    Ok(())
}

/// Hash of the fields that must not change between a save and a load
pub fn calculate_integrity_hash(record: &InstanceRecord) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();

    record.version.hash(&mut hasher);
    record.instance_id.hash(&mut hasher);
    record.workflow_name.hash(&mut hasher);
    record.status.to_string().hash(&mut hasher);
    format!("{:?}", record.phase).hash(&mut hasher);
    record.input.organization.hash(&mut hasher);
    record.input.num_of_users.hash(&mut hasher);
    record.output.map(|o| o.processed).hash(&mut hasher);
    record.error.hash(&mut hasher);
    record.created_at.timestamp().hash(&mut hasher);

    record.history.len().hash(&mut hasher);
    for entry in &record.history {
        entry.seq.hash(&mut hasher);
        serde_json::to_string(&entry.event)
            .unwrap_or_default()
            .hash(&mut hasher);
    }

    format!("{:x}", hasher.finish())
}

fn checkpoint_metadata(
    record: &InstanceRecord,
    reason: CheckpointReason,
    integrity_checks: bool,
) -> CheckpointMetadata {
    let integrity_hash = if integrity_checks {
        calculate_integrity_hash(record)
    } else {
        "integrity_disabled".to_string()
    };

    CheckpointMetadata {
        checkpoint_id: format!("{}_{}", Utc::now().timestamp(), rand::rng().random::<u32>()),
        creation_reason: reason,
        integrity_hash,
        host_pid: std::process::id().into(),
        hostname: hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string(),
    }
}

/// One `<instance>.instance.json` file per instance plus a locked inbox file
#[derive(Debug, Clone)]
pub struct FileSystemHistoryStore {
    directory: PathBuf,
    enable_integrity_checks: bool,
}

impl FileSystemHistoryStore {
    pub fn new(directory: impl Into<PathBuf>, enable_integrity_checks: bool) -> Self {
        Self {
            directory: directory.into(),
            enable_integrity_checks,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn instance_file_path(&self, instance_id: &str) -> PathBuf {
        self.directory.join(format!("{instance_id}.instance.json"))
    }

    fn inbox_file_path(&self, instance_id: &str) -> PathBuf {
        self.directory.join(format!("{instance_id}.inbox.json"))
    }

    fn inbox_lock_path(&self, instance_id: &str) -> PathBuf {
        self.directory.join(format!("{instance_id}.inbox.lock"))
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<PathBuf, PersistenceError> {
        fs::create_dir_all(&self.directory).await?;

        let record_file = self.instance_file_path(&record.instance_id);
        let serialized = serde_json::to_string_pretty(record)?;

        let temp_file = format!("{}.tmp", record_file.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &record_file).await?;

        Ok(record_file)
    }

    async fn read_record(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, PersistenceError> {
        let record_file = self.instance_file_path(instance_id);
        if !record_file.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&record_file).await?;
        let record: InstanceRecord = serde_json::from_str(&contents)?;
        Ok(Some(record))
    }

    fn verify_integrity(&self, record: &InstanceRecord) -> bool {
        if !self.enable_integrity_checks {
            return true;
        }

        let Some(checkpoint) = &record.checkpoint else {
            return false;
        };
        if checkpoint.integrity_hash == "integrity_disabled" {
            return true;
        }

        let actual_hash = calculate_integrity_hash(record);
        if checkpoint.integrity_hash != actual_hash {
            warn!(
                instance_id = %record.instance_id,
                expected = %checkpoint.integrity_hash,
                actual = %actual_hash,
                "Integrity check failed"
            );
            return false;
        }
        true
    }

    /// Run an inbox operation under an exclusive file lock
    async fn with_inbox<T, F>(&self, instance_id: &str, operation: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Vec<InboxEvent>) -> (T, bool) + Send + 'static,
    {
        validate_instance_id(instance_id)?;
        let directory = self.directory.clone();
        let inbox_path = self.inbox_file_path(instance_id);
        let lock_path = self.inbox_lock_path(instance_id);

        tokio::task::spawn_blocking(move || -> Result<T, PersistenceError> {
            std::fs::create_dir_all(&directory)?;

            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = FileLock::new(lock_file);
            let _guard = lock.write().map_err(|e| PersistenceError::LockError {
                reason: e.to_string(),
            })?;

            let mut inbox: Vec<InboxEvent> = if inbox_path.exists() {
                let contents = std::fs::read_to_string(&inbox_path)?;
                if contents.trim().is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str(&contents)?
                }
            } else {
                Vec::new()
            };

            let (value, dirty) = operation(&mut inbox);
            if dirty {
                let temp_file = format!("{}.tmp", inbox_path.display());
                std::fs::write(&temp_file, serde_json::to_string_pretty(&inbox)?)?;
                std::fs::rename(&temp_file, &inbox_path)?;
            }
            Ok(value)
        })
        .await
        .map_err(|e| PersistenceError::TaskFailed {
            reason: e.to_string(),
        })?
    }
}

#[async_trait]
impl HistoryStore for FileSystemHistoryStore {
    async fn save_instance(
        &self,
        record: &InstanceRecord,
        reason: CheckpointReason,
    ) -> Result<String, PersistenceError> {
        validate_instance_id(&record.instance_id)?;

        let mut record_to_save = record.clone();
        let checkpoint = checkpoint_metadata(&record_to_save, reason, self.enable_integrity_checks);
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        record_to_save.checkpoint = Some(checkpoint);

        let record_file = self.write_record(&record_to_save).await?;

        debug!(
            instance_id = %record.instance_id,
            checkpoint_id = %checkpoint_id,
            reason = ?reason,
            history_len = record.history.len(),
            file = ?record_file,
            "Instance checkpoint saved"
        );

        Ok(checkpoint_id)
    }

    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, PersistenceError> {
        validate_instance_id(instance_id)?;

        let Some(record) = self.read_record(instance_id).await? else {
            debug!(instance_id = %instance_id, "No instance file found");
            return Ok(None);
        };

        if record.version != RECORD_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: RECORD_VERSION.to_string(),
                found: record.version,
            });
        }

        if !self.verify_integrity(&record) {
            return Err(PersistenceError::StateCorruption {
                instance_id: instance_id.to_string(),
                reason: "Integrity check failed".to_string(),
            });
        }

        Ok(Some(record))
    }

    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError> {
        if !self.directory.exists() {
            return Ok(vec![]);
        }

        let mut instances = Vec::new();
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(instance_id) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(".instance.json"))
            {
                instances.push(instance_id.to_string());
            }
        }

        instances.sort();
        Ok(instances)
    }

    async fn mark_terminated(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), PersistenceError> {
        validate_instance_id(instance_id)?;

        let Some(mut record) = self.read_record(instance_id).await? else {
            return Err(PersistenceError::NotFound {
                instance_id: instance_id.to_string(),
            });
        };

        record.version = RECORD_VERSION.to_string();
        record.status = RuntimeStatus::Terminated;
        record.error = Some(reason.to_string());
        record.updated_at = Utc::now();
        self.save_instance(&record, CheckpointReason::Terminated).await?;

        info!(instance_id = %instance_id, reason = %reason, "Instance marked terminated");
        Ok(())
    }

    async fn append_inbox(
        &self,
        instance_id: &str,
        event: InboxEvent,
    ) -> Result<(), PersistenceError> {
        self.with_inbox(instance_id, move |inbox| {
            inbox.push(event);
            ((), true)
        })
        .await
    }

    async fn pending_inbox(&self, instance_id: &str) -> Result<Vec<InboxEvent>, PersistenceError> {
        self.with_inbox(instance_id, |inbox| (inbox.clone(), false))
            .await
    }

    async fn remove_inbox(
        &self,
        instance_id: &str,
        event_id: &str,
    ) -> Result<(), PersistenceError> {
        let event_id = event_id.to_string();
        self.with_inbox(instance_id, move |inbox| {
            let before = inbox.len();
            inbox.retain(|event| event.id != event_id);
            ((), inbox.len() != before)
        })
        .await
    }

    async fn clear_inbox(&self, instance_id: &str) -> Result<usize, PersistenceError> {
        validate_instance_id(instance_id)?;
        let inbox_path = self.inbox_file_path(instance_id);
        let lock_path = self.inbox_lock_path(instance_id);
        if !inbox_path.exists() && !lock_path.exists() {
            return Ok(0);
        }

        let discarded = tokio::task::spawn_blocking(move || -> Result<usize, PersistenceError> {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = FileLock::new(lock_file);
            let _guard = lock.write().map_err(|e| PersistenceError::LockError {
                reason: e.to_string(),
            })?;

            if !inbox_path.exists() {
                return Ok(0);
            }
            let contents = std::fs::read_to_string(&inbox_path)?;
            let pending: Vec<InboxEvent> = if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents)?
            };
            std::fs::remove_file(&inbox_path)?;
            Ok(pending.len())
        })
        .await
        .map_err(|e| PersistenceError::TaskFailed {
            reason: e.to_string(),
        })??;

        if discarded > 0 {
            info!(instance_id = %instance_id, discarded, "Discarded unconsumed inbox events");
        }
        Ok(discarded)
    }
}

/// Process-local history store; clones share the same records
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistoryStore {
    instances: Arc<RwLock<HashMap<String, InstanceRecord>>>,
    inboxes: Arc<RwLock<HashMap<String, Vec<InboxEvent>>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn save_instance(
        &self,
        record: &InstanceRecord,
        reason: CheckpointReason,
    ) -> Result<String, PersistenceError> {
        let mut record_to_save = record.clone();
        let checkpoint = checkpoint_metadata(&record_to_save, reason, false);
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        record_to_save.checkpoint = Some(checkpoint);

        self.instances
            .write()
            .await
            .insert(record.instance_id.clone(), record_to_save);
        Ok(checkpoint_id)
    }

    async fn load_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, PersistenceError> {
        Ok(self.instances.read().await.get(instance_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<String>, PersistenceError> {
        let mut instances: Vec<String> = self.instances.read().await.keys().cloned().collect();
        instances.sort();
        Ok(instances)
    }

    async fn mark_terminated(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), PersistenceError> {
        let mut instances = self.instances.write().await;
        let record = instances
            .get_mut(instance_id)
            .ok_or_else(|| PersistenceError::NotFound {
                instance_id: instance_id.to_string(),
            })?;
        record.status = RuntimeStatus::Terminated;
        record.error = Some(reason.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_inbox(
        &self,
        instance_id: &str,
        event: InboxEvent,
    ) -> Result<(), PersistenceError> {
        self.inboxes
            .write()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn pending_inbox(&self, instance_id: &str) -> Result<Vec<InboxEvent>, PersistenceError> {
        Ok(self
            .inboxes
            .read()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_inbox(
        &self,
        instance_id: &str,
        event_id: &str,
    ) -> Result<(), PersistenceError> {
        if let Some(inbox) = self.inboxes.write().await.get_mut(instance_id) {
            inbox.retain(|event| event.id != event_id);
        }
        Ok(())
    }

    async fn clear_inbox(&self, instance_id: &str) -> Result<usize, PersistenceError> {
        Ok(self
            .inboxes
            .write()
            .await
            .remove(instance_id)
            .map_or(0, |inbox| inbox.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::ActivityKind;
    use crate::models::OnboardingPayload;
    use crate::workflow::history::HistoryEvent;
    use tempfile::TempDir;

    fn create_test_record(instance_id: &str) -> InstanceRecord {
        let mut record =
            InstanceRecord::new(instance_id, "ProcessWorkflow", OnboardingPayload::new("Acme", 3));
        record.append(
            0,
            HistoryEvent::ActivityCompleted {
                activity: ActivityKind::Notify,
                input: serde_json::json!({"message": "Received"}),
                output: serde_json::Value::Null,
            },
        );
        record
    }

    #[tokio::test]
    async fn test_filesystem_store_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), true);
        let record = create_test_record("wf-1");

        let checkpoint_id = store
            .save_instance(&record, CheckpointReason::ActivityRecorded)
            .await
            .unwrap();
        assert!(!checkpoint_id.is_empty());

        let loaded = store.load_instance("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, "wf-1");
        assert_eq!(loaded.history, record.history);

        let checkpoint = loaded.checkpoint.unwrap();
        assert_eq!(checkpoint.checkpoint_id, checkpoint_id);
        assert_eq!(checkpoint.creation_reason, CheckpointReason::ActivityRecorded);
        assert_eq!(checkpoint.host_pid, Some(std::process::id()));

        assert!(store.load_instance("missing").await.unwrap().is_none());
        assert_eq!(store.list_instances().await.unwrap(), vec!["wf-1".to_string()]);
    }

    #[tokio::test]
    async fn test_tampered_history_fails_integrity_check() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), true);
        store
            .save_instance(&create_test_record("wf-1"), CheckpointReason::Scheduled)
            .await
            .unwrap();

        let path = temp_dir.path().join("wf-1.instance.json");
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("\"Acme\"", "\"Globex\"")).unwrap();

        let err = store.load_instance("wf-1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::StateCorruption { .. }));

        store.mark_terminated("wf-1", "integrity check failed").await.unwrap();
        let record = store.load_instance("wf-1").await.unwrap().unwrap();
        assert_eq!(record.status, RuntimeStatus::Terminated);
        assert_eq!(record.error.as_deref(), Some("integrity check failed"));
    }

    #[tokio::test]
    async fn test_integrity_checks_can_be_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), false);
        store
            .save_instance(&create_test_record("wf-1"), CheckpointReason::Scheduled)
            .await
            .unwrap();

        let path = temp_dir.path().join("wf-1.instance.json");
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("\"Acme\"", "\"Globex\"")).unwrap();

        let record = store.load_instance("wf-1").await.unwrap().unwrap();
        assert_eq!(record.input.organization, "Globex");
    }

    #[tokio::test]
    async fn test_rejects_path_like_instance_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), true);

        let err = store.load_instance("../escape").await.unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidInstanceId { .. }));
    }

    #[tokio::test]
    async fn test_inbox_append_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), true);

        let first = InboxEvent::new("manager_approval", None);
        let second = InboxEvent::new("manager_approval", Some(serde_json::json!({"by": "ops"})));
        store.append_inbox("wf-1", first.clone()).await.unwrap();
        store.append_inbox("wf-1", second.clone()).await.unwrap();

        // A separate handle sees the same inbox
        let other = FileSystemHistoryStore::new(temp_dir.path(), true);
        assert_eq!(other.pending_inbox("wf-1").await.unwrap(), vec![first.clone(), second.clone()]);

        other.remove_inbox("wf-1", &first.id).await.unwrap();
        assert_eq!(store.pending_inbox("wf-1").await.unwrap(), vec![second]);
        assert!(store.pending_inbox("wf-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_inbox_removes_pending_events() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSystemHistoryStore::new(temp_dir.path(), true);

        assert_eq!(store.clear_inbox("wf-1").await.unwrap(), 0);

        store
            .append_inbox("wf-1", InboxEvent::new("manager_approval", None))
            .await
            .unwrap();
        store
            .append_inbox("wf-1", InboxEvent::new("escalation", None))
            .await
            .unwrap();

        assert_eq!(store.clear_inbox("wf-1").await.unwrap(), 2);
        assert!(store.pending_inbox("wf-1").await.unwrap().is_empty());
        assert!(!temp_dir.path().join("wf-1.inbox.json").exists());

        let memory = InMemoryHistoryStore::new();
        memory
            .append_inbox("wf-1", InboxEvent::new("manager_approval", None))
            .await
            .unwrap();
        assert_eq!(memory.clear_inbox("wf-1").await.unwrap(), 1);
        assert!(memory.pending_inbox("wf-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_shares_records_between_clones() {
        let store = InMemoryHistoryStore::new();
        let handle = store.clone();

        handle
            .save_instance(&create_test_record("wf-1"), CheckpointReason::Scheduled)
            .await
            .unwrap();
        let loaded = store.load_instance("wf-1").await.unwrap().unwrap();
        assert!(loaded.checkpoint.is_some());

        store.mark_terminated("wf-1", "operator request").await.unwrap();
        let loaded = handle.load_instance("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RuntimeStatus::Terminated);
    }

    #[test]
    fn test_integrity_hash_tracks_history() {
        let mut record = create_test_record("wf-1");
        let before = calculate_integrity_hash(&record);
        assert_eq!(before, calculate_integrity_hash(&record.clone()));

        record.append(
            1,
            HistoryEvent::EventTimedOut {
                name: "manager_approval".to_string(),
            },
        );
        assert_ne!(before, calculate_integrity_hash(&record));
    }
}
