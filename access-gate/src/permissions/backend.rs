//! Permission backends
//!
//! The real backend is external (an API service, a database) and plugs in
//! through [`PermissionBackend`]. The static backend covers embedding,
//! fixtures and tests.

use access_gate_api::{PermissionSet, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::PermissionError;

/// Source of truth for granular permissions
///
/// # Example
///
/// ```rust
/// use access_gate::permissions::{PermissionBackend, PermissionError};
/// use access_gate_api::{PermissionSet, Role};
/// use async_trait::async_trait;
///
/// struct EveryoneSeesReports;
///
/// #[async_trait]
/// impl PermissionBackend for EveryoneSeesReports {
///     async fn fetch(&self, _identity: &str, _role: Role) -> Result<PermissionSet, PermissionError> {
///         Ok(PermissionSet::new().with_tab("reports", "summary"))
///     }
/// }
/// ```
#[async_trait]
pub trait PermissionBackend: Send + Sync {
    async fn fetch(&self, identity: &str, role: Role) -> Result<PermissionSet, PermissionError>;
}

#[async_trait]
impl<T: PermissionBackend + ?Sized> PermissionBackend for Arc<T> {
    async fn fetch(&self, identity: &str, role: Role) -> Result<PermissionSet, PermissionError> {
        (**self).fetch(identity, role).await
    }
}

/// Serialized form shared by the static and file backends
///
/// Identity entries take precedence over role entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionDocument {
    #[serde(default)]
    pub identities: HashMap<String, PermissionSet>,
    #[serde(default)]
    pub roles: HashMap<Role, PermissionSet>,
}

impl PermissionDocument {
    /// Set for an identity; unknown identities with no role entry get the
    /// empty set
    pub fn resolve(&self, identity: &str, role: Role) -> PermissionSet {
        self.identities
            .get(identity)
            .or_else(|| self.roles.get(&role))
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory backend
#[derive(Debug, Clone, Default)]
pub struct StaticPermissionBackend {
    document: PermissionDocument,
}

impl StaticPermissionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: PermissionDocument) -> Self {
        Self { document }
    }

    pub fn with_identity(mut self, identity: impl Into<String>, set: PermissionSet) -> Self {
        self.document.identities.insert(identity.into(), set);
        self
    }

    pub fn with_role(mut self, role: Role, set: PermissionSet) -> Self {
        self.document.roles.insert(role, set);
        self
    }
}

#[async_trait]
impl PermissionBackend for StaticPermissionBackend {
    async fn fetch(&self, identity: &str, role: Role) -> Result<PermissionSet, PermissionError> {
        Ok(self.document.resolve(identity, role))
    }
}
