//! Key/value state store contract used by the onboarding activities.
//!
//! The store owns one [`WorkflowItem`] per organization. Implementations must
//! give read-after-write consistency for a single key; nothing here relies on
//! cross-key transactions. Every reader and writer derives the key through
//! [`StoreKey::for_organization`], so there is exactly one encoding rule.

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::config::StateStoreConfig;
use crate::models::WorkflowItem;

/// Errors surfaced by a state store
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("State store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Malformed record for key {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("Lock acquisition failed: {reason}")]
    LockError { reason: String },
}

/// Canonical store key for an organization record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    /// Organization names are used verbatim, with no escaping
    pub fn for_organization(organization: &str) -> Self {
        Self(organization.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Byte-level key/value operations required by the activities
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the value stored under `key`, `None` when absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateStoreError>;

    /// Write `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StateStoreError>;

    /// Remove `key`; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StateStoreError>;
}

/// Load and decode the record for an organization
pub async fn read_item(
    store: &dyn StateStore,
    organization: &str,
) -> Result<Option<WorkflowItem>, StateStoreError> {
    let key = StoreKey::for_organization(organization);
    let Some(bytes) = store.get(key.as_str()).await? else {
        debug!(key = %key, "No record stored for organization");
        return Ok(None);
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StateStoreError::MalformedRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

/// Encode and store the record for an organization
pub async fn write_item(
    store: &dyn StateStore,
    organization: &str,
    item: &WorkflowItem,
) -> Result<(), StateStoreError> {
    let key = StoreKey::for_organization(organization);
    let bytes = serde_json::to_vec(item)?;
    store.set(key.as_str(), bytes).await
}

/// Delete the record for an organization; deleting an absent record succeeds
pub async fn remove_item(
    store: &dyn StateStore,
    organization: &str,
) -> Result<(), StateStoreError> {
    let key = StoreKey::for_organization(organization);
    store.delete(key.as_str()).await?;
    tracing::info!(key = %key, "Removed organization record");
    Ok(())
}

/// File-backed store when a path is configured, in-memory otherwise
pub fn open_store(config: &StateStoreConfig) -> Arc<dyn StateStore> {
    match &config.file_path {
        Some(path) => {
            debug!(store = %config.store_name, file = ?path, "Using file state store");
            Arc::new(FileStateStore::new(path))
        }
        None => {
            debug!(store = %config.store_name, "Using in-memory state store");
            Arc::new(InMemoryStateStore::new())
        }
    }
}

/// Create the onboarding record an instance will verify against
pub async fn seed_organization(
    store: &dyn StateStore,
    item: &WorkflowItem,
) -> Result<(), StateStoreError> {
    tracing::info!(
        organization = %item.organization,
        num_of_users = item.num_of_users,
        "Creating request for new organization entity"
    );
    write_item(store, &item.organization, item).await
}
