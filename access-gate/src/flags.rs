//! Global feature flags
//!
//! A flat `name -> bool` map merged from a fixed default set and whatever was
//! persisted under [`FEATURE_FLAGS_KEY`]. The persisted blob may predate
//! newer defaults (missing keys are default-filled) and may be garbage
//! (discarded wholesale). Neither case is an error for callers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::audit::{self, AuditSink};
use crate::storage::{KeyValueStorage, StorageError};

/// Storage key holding the persisted flag map
pub const FEATURE_FLAGS_KEY: &str = "feature_flags";

#[derive(Debug, Error)]
pub enum FlagError {
    /// Name is not part of the current flag set; nothing was changed
    #[error("Unknown feature flag: {0}")]
    UnknownFlag(String),

    /// In-memory change applied but could not be persisted
    #[error("Failed to persist feature flags: {0}")]
    Storage(#[from] StorageError),
}

/// Default flag values shipped with the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDefaults(BTreeMap<String, bool>);

impl FlagDefaults {
    /// No defaults at all
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// The dashboard's known flags
    pub fn standard() -> Self {
        Self::empty()
            .with("analytics_dashboard", true)
            .with("advanced_charts", false)
            .with("export_reports", true)
            .with("widget_reordering", true)
            .with("realtime_updates", false)
            .with("beta_features", false)
    }

    pub fn with(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.0.insert(name.into(), enabled);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn as_map(&self) -> &BTreeMap<String, bool> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FlagDefaults {
    fn default() -> Self {
        Self::standard()
    }
}

/// What `load()` found in storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing persisted; defaults only
    Defaults,
    /// Persisted map merged onto defaults
    Merged {
        /// Default keys the blob did not contain
        filled: usize,
    },
    /// Blob unreadable; defaults substituted
    Recovered,
}

/// Store for global boolean feature flags
///
/// Every mutation holds the map lock across read-modify-persist, so writers
/// are serialized and the persisted blob is last-write-wins.
pub struct FeatureFlagStore {
    storage: Arc<dyn KeyValueStorage>,
    defaults: FlagDefaults,
    flags: Mutex<BTreeMap<String, bool>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl FeatureFlagStore {
    /// Create a store holding only the defaults; call [`load`](Self::load)
    /// to pick up persisted values
    pub fn new(storage: Arc<dyn KeyValueStorage>, defaults: FlagDefaults) -> Self {
        let flags = defaults.as_map().clone();
        Self {
            storage,
            defaults,
            flags: Mutex::new(flags),
            audit: None,
        }
    }

    /// Create and load in one step
    pub fn open(storage: Arc<dyn KeyValueStorage>, defaults: FlagDefaults) -> Self {
        let store = Self::new(storage, defaults);
        store.load();
        store
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Re-read storage and merge it onto the defaults
    ///
    /// Persisted values win on conflict and persisted keys unknown to the
    /// defaults are kept.
    pub fn load(&self) -> LoadOutcome {
        let mut merged = self.defaults.as_map().clone();

        let outcome = match self.storage.get(FEATURE_FLAGS_KEY) {
            Ok(None) => LoadOutcome::Defaults,
            Ok(Some(blob)) => match serde_json::from_str::<BTreeMap<String, bool>>(&blob) {
                Ok(persisted) => {
                    let filled = self
                        .defaults
                        .as_map()
                        .keys()
                        .filter(|k| !persisted.contains_key(*k))
                        .count();
                    merged.extend(persisted);
                    LoadOutcome::Merged { filled }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Persisted feature flags are malformed, using defaults");
                    LoadOutcome::Recovered
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read feature flags, using defaults");
                LoadOutcome::Recovered
            }
        };

        let count = merged.len();
        *self.lock() = merged;

        tracing::info!(count, outcome = ?outcome, "Feature flags loaded");
        audit::record_quietly(
            self.audit.as_deref(),
            audit::flags_loaded(count, outcome == LoadOutcome::Recovered),
        );
        outcome
    }

    /// Current value; `false` for unknown names
    pub fn get(&self, name: &str) -> bool {
        match self.lock().get(name) {
            Some(value) => *value,
            None => {
                tracing::debug!(flag = name, "Unknown feature flag resolves to disabled");
                false
            }
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Snapshot of the whole set
    pub fn flags(&self) -> BTreeMap<String, bool> {
        self.lock().clone()
    }

    pub fn defaults(&self) -> &FlagDefaults {
        &self.defaults
    }

    /// Set an existing flag and persist
    pub fn set(&self, name: &str, enabled: bool) -> Result<(), FlagError> {
        let mut flags = self.lock();
        match flags.get_mut(name) {
            Some(value) => *value = enabled,
            None => return Err(FlagError::UnknownFlag(name.to_string())),
        }
        self.persist(&flags)?;
        drop(flags);

        tracing::info!(flag = name, enabled, "Feature flag set");
        audit::record_quietly(self.audit.as_deref(), audit::flag_changed(name, enabled));
        Ok(())
    }

    /// Flip an existing flag, persist, and return the new value
    pub fn toggle(&self, name: &str) -> Result<bool, FlagError> {
        let mut flags = self.lock();
        let enabled = match flags.get_mut(name) {
            Some(value) => {
                *value = !*value;
                *value
            }
            None => return Err(FlagError::UnknownFlag(name.to_string())),
        };
        self.persist(&flags)?;
        drop(flags);

        tracing::info!(flag = name, enabled, "Feature flag toggled");
        audit::record_quietly(self.audit.as_deref(), audit::flag_changed(name, enabled));
        Ok(enabled)
    }

    /// Replace the whole set with the defaults and persist
    pub fn reset_to_defaults(&self) -> Result<(), FlagError> {
        let mut flags = self.lock();
        *flags = self.defaults.as_map().clone();
        self.persist(&flags)?;
        let count = flags.len();
        drop(flags);

        tracing::info!(count, "Feature flags reset to defaults");
        audit::record_quietly(self.audit.as_deref(), audit::flags_reset(count));
        Ok(())
    }

    fn persist(&self, flags: &BTreeMap<String, bool>) -> Result<(), StorageError> {
        let blob = serde_json::to_string(flags)?;
        self.storage.set(FEATURE_FLAGS_KEY, &blob)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, bool>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FeatureFlagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlagStore")
            .field("flags", &*self.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use crate::storage::{MemoryStorage, ReadOnlyStorage};

    fn defaults() -> FlagDefaults {
        FlagDefaults::empty()
            .with("export_reports", true)
            .with("beta_features", false)
    }

    fn persisted(storage: &dyn KeyValueStorage) -> BTreeMap<String, bool> {
        let blob = storage.get(FEATURE_FLAGS_KEY).unwrap().unwrap();
        serde_json::from_str(&blob).unwrap()
    }

    #[test]
    fn test_load_without_blob_uses_defaults() {
        let store = FeatureFlagStore::new(Arc::new(MemoryStorage::new()), defaults());
        assert_eq!(store.load(), LoadOutcome::Defaults);
        assert_eq!(&store.flags(), defaults().as_map());
    }

    #[test]
    fn test_load_fills_missing_default_keys() {
        let storage = MemoryStorage::new()
            .with_entry(FEATURE_FLAGS_KEY, r#"{"export_reports":false,"legacy_grid":true}"#);
        let store = FeatureFlagStore::new(Arc::new(storage), defaults());

        assert_eq!(store.load(), LoadOutcome::Merged { filled: 1 });
        assert!(!store.get("export_reports"));
        assert!(!store.get("beta_features"));
        assert!(store.is_known("beta_features"));
        assert!(store.get("legacy_grid"));
    }

    #[test]
    fn test_load_malformed_blob_falls_back() {
        for blob in ["{not json", r#"{"export_reports":"yes"}"#, "[true]"] {
            let storage = MemoryStorage::new().with_entry(FEATURE_FLAGS_KEY, blob);
            let store = FeatureFlagStore::new(Arc::new(storage), defaults());

            assert_eq!(store.load(), LoadOutcome::Recovered, "blob: {}", blob);
            assert_eq!(&store.flags(), defaults().as_map());
        }
    }

    #[test]
    fn test_unknown_flag_reads_false() {
        let store = FeatureFlagStore::open(Arc::new(MemoryStorage::new()), defaults());
        assert!(!store.get("does_not_exist"));
        assert!(!store.is_known("does_not_exist"));
    }

    #[test]
    fn test_set_persists_full_map() {
        let storage = Arc::new(MemoryStorage::new());
        let store = FeatureFlagStore::open(storage.clone(), defaults());

        store.set("beta_features", true).unwrap();
        assert!(store.get("beta_features"));

        let saved = persisted(storage.as_ref());
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.get("beta_features"), Some(&true));
        assert_eq!(saved.get("export_reports"), Some(&true));
    }

    #[test]
    fn test_set_unknown_flag_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let store = FeatureFlagStore::open(storage.clone(), defaults());

        assert!(matches!(
            store.set("nope", true),
            Err(FlagError::UnknownFlag(name)) if name == "nope"
        ));
        assert!(matches!(store.toggle("nope"), Err(FlagError::UnknownFlag(_))));
        assert!(!store.is_known("nope"));
        assert!(storage.get(FEATURE_FLAGS_KEY).unwrap().is_none());
    }

    #[test]
    fn test_toggle_returns_new_value() {
        let store = FeatureFlagStore::open(Arc::new(MemoryStorage::new()), defaults());
        assert!(!store.toggle("export_reports").unwrap());
        assert!(store.toggle("export_reports").unwrap());
    }

    #[test]
    fn test_reset_then_load_yields_defaults() {
        let storage = MemoryStorage::new()
            .with_entry(FEATURE_FLAGS_KEY, r#"{"export_reports":false,"legacy_grid":true}"#);
        let store = FeatureFlagStore::open(Arc::new(storage), defaults());

        store.reset_to_defaults().unwrap();
        store.load();

        assert_eq!(&store.flags(), defaults().as_map());
    }

    #[test]
    fn test_read_only_storage_reports_persist_failure() {
        let storage = ReadOnlyStorage::new(MemoryStorage::new());
        let store = FeatureFlagStore::open(Arc::new(storage), defaults());

        assert!(matches!(
            store.set("beta_features", true),
            Err(FlagError::Storage(StorageError::ReadOnly))
        ));
        // In-memory value is still updated
        assert!(store.get("beta_features"));
    }

    #[test]
    fn test_mutations_are_audited() {
        let sink = Arc::new(MemoryAuditSink::new());
        let store = FeatureFlagStore::new(Arc::new(MemoryStorage::new()), defaults())
            .with_audit(sink.clone());

        store.load();
        store.toggle("beta_features").unwrap();
        store.reset_to_defaults().unwrap();

        assert_eq!(sink.find_by_type(AuditEventType::FlagsLoaded).len(), 1);
        assert_eq!(sink.find_by_type(AuditEventType::FlagChanged).len(), 1);
        assert_eq!(sink.find_by_type(AuditEventType::FlagsReset).len(), 1);
    }
}
