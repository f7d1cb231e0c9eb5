//! Key-value storage capability
//!
//! The flag store persists through this trait so the backend can be swapped
//! (file, memory, read-only) without touching flag semantics. Values are
//! opaque string blobs; callers own the encoding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode storage document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Storage is read-only")]
    ReadOnly,
}

/// Blob storage injected into stores that persist state
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

// ============================================================================
// File-based Storage
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StorageDocument {
    version: u32,
    entries: HashMap<String, String>,
}

impl StorageDocument {
    fn new() -> Self {
        Self {
            version: 1,
            entries: HashMap::new(),
        }
    }
}

/// JSON document on disk holding every key
///
/// Default: `~/.config/<app>/storage.json`. The whole document is rewritten
/// on every mutation.
pub struct FileStorage {
    path: PathBuf,
    data: RwLock<StorageDocument>,
}

impl FileStorage {
    /// Open (or lazily create) the document at `path`
    ///
    /// A document that cannot be parsed opens empty; it is replaced on the
    /// next write.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            match serde_json::from_reader(reader) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable storage document");
                    StorageDocument::new()
                }
            }
        } else {
            StorageDocument::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Storage in the default location for an application
    pub fn default_for_app(app_name: &str) -> Result<Self, StorageError> {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        Self::new(config_dir.join(app_name).join("storage.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the document
    fn save(&self, data: &StorageDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = self.path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer_pretty(&mut writer, data)?;
            writer.flush()?;
        }
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.entries.insert(key.to_string(), value.to_string());
        self.save(&data)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(&data)
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// Session-only storage, mainly for tests
pub struct MemoryStorage {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-seed a key, e.g. with a blob written by an older release
    pub fn with_entry(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.remove(key);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("count", &self.len())
            .finish()
    }
}

// ============================================================================
// Read-Only Storage
// ============================================================================

/// Read-only wrapper for any storage
///
/// For locked-down deployments where flags are provisioned ahead of time.
pub struct ReadOnlyStorage<S: KeyValueStorage> {
    inner: S,
}

impl<S: KeyValueStorage> ReadOnlyStorage<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: KeyValueStorage> KeyValueStorage for ReadOnlyStorage<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::ReadOnly)
    }
}

impl<S: KeyValueStorage + std::fmt::Debug> std::fmt::Debug for ReadOnlyStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyStorage")
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        storage.set("feature_flags", "{}").unwrap();
        assert_eq!(storage.get("feature_flags").unwrap().as_deref(), Some("{}"));

        storage.remove("feature_flags").unwrap();
        assert!(storage.get("feature_flags").unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let storage = FileStorage::new(&path).unwrap();
        storage.set("feature_flags", r#"{"beta_features":true}"#).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = FileStorage::new(&path).unwrap();
        assert_eq!(
            reopened.get("feature_flags").unwrap().as_deref(),
            Some(r#"{"beta_features":true}"#)
        );
    }

    #[test]
    fn test_file_storage_corrupt_document_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "not json at all").unwrap();

        let storage = FileStorage::new(&path).unwrap();
        assert!(storage.get("feature_flags").unwrap().is_none());

        storage.set("feature_flags", "{}").unwrap();
        let reopened = FileStorage::new(&path).unwrap();
        assert!(reopened.get("feature_flags").unwrap().is_some());
    }

    #[test]
    fn test_read_only_storage() {
        let inner = MemoryStorage::new().with_entry("feature_flags", "{}");
        let storage = ReadOnlyStorage::new(inner);

        assert!(storage.get("feature_flags").unwrap().is_some());
        assert!(matches!(
            storage.set("feature_flags", "{}"),
            Err(StorageError::ReadOnly)
        ));
        assert!(matches!(
            storage.remove("feature_flags"),
            Err(StorageError::ReadOnly)
        ));
    }
}
