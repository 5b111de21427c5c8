use async_trait::async_trait;
use fd_lock::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{StateStore, StateStoreError};

type Document = BTreeMap<String, String>;

/// State store backed by a single JSON document on disk.
///
/// Each operation takes an exclusive `fd-lock` on a sibling `.lock` file and
/// re-reads the document, so separate processes sharing the file observe each
/// other's writes. Writes go through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn with_document<T, F>(&self, operation: F) -> Result<T, StateStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut Document) -> Result<(T, bool), StateStoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || -> Result<T, StateStoreError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }

            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);
            let _guard = lock.write().map_err(|e| StateStoreError::LockError {
                reason: e.to_string(),
            })?;

            let mut document = load_document(&path)?;
            let (value, dirty) = operation(&path, &mut document)?;
            if dirty {
                save_document(&path, &document)?;
            }
            Ok(value)
        })
        .await
        .map_err(|e| StateStoreError::Unavailable {
            reason: format!("state store task failed: {e}"),
        })?
    }
}

fn load_document(path: &Path) -> Result<Document, StateStoreError> {
    if !path.exists() {
        return Ok(Document::new());
    }

    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Document::new());
    }

    serde_json::from_str(&contents).map_err(|e| StateStoreError::Unavailable {
        reason: format!("store file {} is unreadable: {e}", path.display()),
    })
}

fn save_document(path: &Path, document: &Document) -> Result<(), StateStoreError> {
    let serialized = serde_json::to_string_pretty(document)?;
    let temp_file = format!("{}.tmp", path.display());
    fs::write(&temp_file, serialized)?;
    fs::rename(&temp_file, path)?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateStoreError> {
        let key = key.to_string();
        self.with_document(move |path, document| {
            let value = document.get(&key).map(|v| v.as_bytes().to_vec());
            debug!(file = ?path, key = %key, found = value.is_some(), "State store read");
            Ok((value, false))
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StateStoreError> {
        let key = key.to_string();
        let value = String::from_utf8(value).map_err(|e| StateStoreError::MalformedRecord {
            key: key.clone(),
            reason: format!("value is not UTF-8: {e}"),
        })?;

        self.with_document(move |path, document| {
            document.insert(key.clone(), value);
            info!(file = ?path, key = %key, "State store write");
            Ok(((), true))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StateStoreError> {
        let key = key.to_string();
        self.with_document(move |_, document| {
            let removed = document.remove(&key).is_some();
            Ok(((), removed))
        })
        .await
    }
}
