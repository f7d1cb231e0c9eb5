//! Granular module/tab permissions
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 PermissionsStore (trait)                      │
//! │                                                              │
//! │   CachedPermissionsStore<B>                                  │
//! │   ├── per-identity memo   (PermissionSet, latest fetch wins) │
//! │   ├── single-flight       (one in-flight fetch per identity) │
//! │   └── PermissionBackend B                                    │
//! │         └── StaticPermissionBackend  (in-memory document)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Queries never block and never fail: an identity whose permissions have
//! not been loaded is denied everything.

pub mod backend;
pub mod cache;

pub use backend::{PermissionBackend, PermissionDocument, StaticPermissionBackend};
pub use cache::CachedPermissionsStore;

use access_gate_api::Role;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure to obtain permissions from the backend
///
/// `Clone` because one result is shared by every caller joined to the same
/// in-flight fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Permission backend failed: {0}")]
    Backend(String),

    #[error("Permission fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-identity permission data consumed by the resolver
///
/// Queries take the identity explicitly so concurrent evaluations for
/// different identities cannot read each other's sets.
#[async_trait]
pub trait PermissionsStore: Send + Sync {
    /// Ensure permissions for `identity` are loaded
    ///
    /// Idempotent: returns immediately once loaded. Concurrent calls for the
    /// same identity share one backend fetch.
    async fn fetch_permissions(&self, identity: &str, role: Role) -> Result<(), PermissionError>;

    /// Fetch again even if loaded; the result replaces the current set
    /// wholesale and supersedes any older in-flight fetch
    async fn refresh_permissions(&self, identity: &str, role: Role)
        -> Result<(), PermissionError>;

    /// `false` until a fetch for `identity` has succeeded
    fn can_access_module(&self, identity: &str, module: &str) -> bool;

    /// `false` until a fetch for `identity` has succeeded
    fn can_access_tab(&self, identity: &str, module: &str, tab: &str) -> bool;

    fn is_loaded(&self, identity: &str) -> bool;

    /// Drop everything held for `identity`, including in-flight results
    fn discard(&self, identity: &str);
}
