//! access-gate: access decision engine
//!
//! Decides whether the current session may perform a protected operation by
//! merging two authorization models:
//!
//! - the legacy model: admin/superadmin roles plus global feature flags
//!   ([`flags::FeatureFlagStore`]);
//! - the granular model: per-identity module/tab permissions loaded
//!   asynchronously ([`permissions::PermissionsStore`]).
//!
//! A request is allowed when either model allows it (see [`resolver`]).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use access_gate::{GatePresets, Guard, StaticPermissionBackend, StaticSessionProvider};
//! use access_gate_api::{AccessRequest, PermissionSet, Role};
//! use std::sync::Arc;
//!
//! let session = Arc::new(StaticSessionProvider::anonymous());
//! let backend = StaticPermissionBackend::new()
//!     .with_role(Role::Manager, PermissionSet::new().with_tab("reports", "summary"));
//!
//! let resolver = GatePresets::persistent("dashboard", session.clone(), backend)?.into_resolver();
//!
//! session.sign_in("u-42", Role::Manager);
//! let guard = Guard::new(resolver);
//! guard.evaluate(AccessRequest::new().module("reports").tab("summary"));
//! let state = guard.settled().await;
//! assert!(state.allowed);
//! ```

pub mod audit;
pub mod config;
pub mod flags;
pub mod guard;
pub mod permissions;
pub mod resolver;
pub mod session;
pub mod storage;
#[cfg(feature = "subscriber")]
pub mod telemetry;

pub use access_gate_api::{
    AccessDecision, AccessRequest, DecisionReason, GuardState, PermissionSet, Role, Session,
};
pub use config::{GateConfig, GateConfigBuilder, GatePresets, PresetError};
pub use flags::{FeatureFlagStore, FlagDefaults, FlagError, LoadOutcome, FEATURE_FLAGS_KEY};
pub use guard::Guard;
pub use permissions::{
    CachedPermissionsStore, PermissionBackend, PermissionError, PermissionsStore,
    StaticPermissionBackend,
};
pub use resolver::{AccessResolver, Evaluation, EvaluationState, PendingEvaluation};
pub use session::{SessionProvider, SessionSnapshot, StaticSessionProvider};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, ReadOnlyStorage, StorageError};
