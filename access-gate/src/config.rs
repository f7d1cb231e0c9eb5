//! Wiring: configuration bundle, builder and presets
//!
//! Every collaborator is constructed here and injected into the resolver;
//! there are no process-wide singletons. Build one [`GateConfig`] at
//! startup, turn it into an [`AccessResolver`], and hand clones of the
//! resolver (or guards built from it) to consumers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
use crate::flags::{FeatureFlagStore, FlagDefaults};
use crate::permissions::{
    CachedPermissionsStore, PermissionBackend, PermissionsStore,
};
use crate::resolver::AccessResolver;
use crate::session::SessionProvider;
use crate::storage::{FileStorage, KeyValueStorage, MemoryStorage, ReadOnlyStorage};

/// Complete set of collaborators for a resolver
pub struct GateConfig {
    pub session: Arc<dyn SessionProvider>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub permissions: Arc<dyn PermissionsStore>,
    pub audit: Arc<dyn AuditSink>,
    pub flag_defaults: FlagDefaults,
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field("flag_defaults", &self.flag_defaults)
            .finish_non_exhaustive()
    }
}

impl GateConfig {
    /// Load the flag store and build the resolver
    pub fn into_resolver(self) -> AccessResolver {
        let flags = FeatureFlagStore::new(self.storage, self.flag_defaults)
            .with_audit(Arc::clone(&self.audit));
        flags.load();
        AccessResolver::new(self.session, Arc::new(flags), self.permissions).with_audit(self.audit)
    }
}

/// Builder for [`GateConfig`]
pub struct GateConfigBuilder {
    app_name: Option<String>,
    session: Option<Arc<dyn SessionProvider>>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    permissions: Option<Arc<dyn PermissionsStore>>,
    backend: Option<Arc<dyn PermissionBackend>>,
    audit: Option<Arc<dyn AuditSink>>,
    flag_defaults: FlagDefaults,
    fetch_timeout: Option<Duration>,
}

impl GateConfigBuilder {
    pub fn new() -> Self {
        Self {
            app_name: None,
            session: None,
            storage: None,
            permissions: None,
            backend: None,
            audit: None,
            flag_defaults: FlagDefaults::standard(),
            fetch_timeout: None,
        }
    }

    /// Application name, used for default file locations
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn session(mut self, session: impl SessionProvider + 'static) -> Self {
        self.session = Some(Arc::new(session));
        self
    }

    /// Share a provider the application keeps a handle to
    pub fn shared_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn storage(mut self, storage: impl KeyValueStorage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Use a ready-made permissions store as is
    ///
    /// The store keeps its own timeout and audit wiring; combining it with
    /// [`fetch_timeout`](Self::fetch_timeout) or a backend is rejected by
    /// [`build`](Self::build), and the builder's audit sink only receives
    /// decision and flag events.
    pub fn permissions(mut self, store: impl PermissionsStore + 'static) -> Self {
        self.permissions = Some(Arc::new(store));
        self
    }

    /// Wrap a backend in a [`CachedPermissionsStore`]
    pub fn permission_backend(mut self, backend: impl PermissionBackend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    pub fn flag_defaults(mut self, defaults: FlagDefaults) -> Self {
        self.flag_defaults = defaults;
        self
    }

    /// Timeout applied to backend fetches
    pub fn fetch_timeout(mut self, limit: Duration) -> Self {
        self.fetch_timeout = Some(limit);
        self
    }

    pub fn build(self) -> Result<GateConfig, PresetError> {
        let app_name = self.app_name.as_deref().unwrap_or("access-gate");

        let session = self
            .session
            .ok_or_else(|| PresetError::InvalidConfig("a session provider is required".into()))?;

        let audit: Arc<dyn AuditSink> = self.audit.unwrap_or_else(|| Arc::new(NullAuditSink));

        let storage: Arc<dyn KeyValueStorage> = match self.storage {
            Some(s) => s,
            None => {
                let storage = FileStorage::default_for_app(app_name)
                    .map_err(|e| PresetError::StorageInit(e.to_string()))?;
                Arc::new(storage)
            }
        };

        let permissions: Arc<dyn PermissionsStore> = match (self.permissions, self.backend) {
            (Some(_), Some(_)) => {
                return Err(PresetError::InvalidConfig(
                    "set either a permissions store or a permission backend, not both".into(),
                ))
            }
            (Some(_), None) if self.fetch_timeout.is_some() => {
                return Err(PresetError::InvalidConfig(
                    "fetch_timeout only applies to a permission backend".into(),
                ))
            }
            (Some(store), None) => store,
            (None, Some(backend)) => {
                let mut store = CachedPermissionsStore::new(backend).with_audit(Arc::clone(&audit));
                if let Some(limit) = self.fetch_timeout {
                    store = store.with_timeout(limit);
                }
                Arc::new(store)
            }
            (None, None) => {
                return Err(PresetError::InvalidConfig(
                    "a permissions store or permission backend is required".into(),
                ))
            }
        };

        Ok(GateConfig {
            session,
            storage,
            permissions,
            audit,
            flag_defaults: self.flag_defaults,
        })
    }
}

impl Default for GateConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("Failed to initialize storage: {0}")]
    StorageInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Preset Configurations
// ============================================================================

/// Ready-made configurations
pub struct GatePresets;

impl GatePresets {
    /// File-backed flags and audit log in the user config directory
    pub fn persistent(
        app_name: &str,
        session: Arc<dyn SessionProvider>,
        backend: impl PermissionBackend + 'static,
    ) -> Result<GateConfig, PresetError> {
        let config_dir = config_dir(app_name);

        let storage = FileStorage::new(config_dir.join("storage.json"))
            .map_err(|e| PresetError::StorageInit(e.to_string()))?;
        let audit = FileAuditSink::new(config_dir.join("audit.jsonl"))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        GateConfigBuilder::new()
            .app_name(app_name)
            .shared_session(session)
            .storage(storage)
            .permission_backend(backend)
            .audit(audit)
            .build()
    }

    /// Flags provisioned ahead of time and never written
    pub fn read_only(
        storage_path: impl AsRef<Path>,
        session: Arc<dyn SessionProvider>,
        backend: impl PermissionBackend + 'static,
    ) -> Result<GateConfig, PresetError> {
        let storage = FileStorage::new(storage_path)
            .map_err(|e| PresetError::StorageInit(e.to_string()))?;

        GateConfigBuilder::new()
            .shared_session(session)
            .storage(ReadOnlyStorage::new(storage))
            .permission_backend(backend)
            .build()
    }

    /// Everything in memory
    pub fn testing(
        session: Arc<dyn SessionProvider>,
        backend: impl PermissionBackend + 'static,
    ) -> GateConfig {
        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
        GateConfig {
            session,
            storage: Arc::new(MemoryStorage::new()),
            permissions: Arc::new(CachedPermissionsStore::new(backend).with_audit(Arc::clone(&audit))),
            audit,
            flag_defaults: FlagDefaults::standard(),
        }
    }
}

fn config_dir(app_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(app_name)
}
