//! access-gate-api: Shared types for the access-gate decision engine
//!
//! This crate defines the data exchanged between the session provider,
//! the permission backend, the resolver and whatever gates a protected
//! operation. Everything here is plain serde data with no I/O.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Role of an identity in the legacy role-based model
///
/// Variants are declared in ascending order of privilege so that the derived
/// `Ord` matches the role hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum Role {
    /// Read-only access (also the fallback for unrecognised role names)
    Viewer,
    /// Regular user
    Member,
    /// Team manager
    Manager,
    /// Administrator
    Admin,
    /// Superadmin, satisfies every access predicate
    SuperAdmin,
}

impl Role {
    /// Parse a role name; unknown names map to [`Role::Viewer`]
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "superadmin" | "super_admin" => Role::SuperAdmin,
            "admin" => Role::Admin,
            "manager" => Role::Manager,
            "member" | "user" => Role::Member,
            _ => Role::Viewer,
        }
    }

    /// Canonical snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Manager => "manager",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
        }
    }

    pub fn is_superadmin(&self) -> bool {
        matches!(self, Role::SuperAdmin)
    }

    /// Admin or superadmin
    pub fn is_admin_or_above(&self) -> bool {
        *self >= Role::Admin
    }
}

impl From<String> for Role {
    fn from(name: String) -> Self {
        Role::parse(&name)
    }
}

impl From<Role> for &'static str {
    fn from(role: Role) -> Self {
        role.as_str()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current session as issued by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Stable identity (user id)
    pub identity: String,
    /// Role in the legacy model
    pub role: Role,
    /// Whether the session is backed by a valid login
    pub authenticated: bool,
}

impl Session {
    /// Create an authenticated session
    pub fn authenticated(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
            authenticated: true,
        }
    }

    /// Create a session with no valid login
    pub fn anonymous() -> Self {
        Self {
            identity: String::new(),
            role: Role::Viewer,
            authenticated: false,
        }
    }
}

/// Descriptor of a protected operation
///
/// `required_tab` is only meaningful together with `required_module`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRequest {
    #[serde(default)]
    pub require_admin: bool,

    #[serde(default)]
    pub require_super_admin: bool,

    /// Feature flag that must be enabled
    #[serde(default)]
    pub required_feature: Option<String>,

    /// Module the identity must be able to access
    #[serde(default)]
    pub required_module: Option<String>,

    /// Tab within `required_module`
    #[serde(default)]
    pub required_tab: Option<String>,
}

impl AccessRequest {
    /// Create an unconstrained request
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the admin role (or above)
    pub fn admin(mut self) -> Self {
        self.require_admin = true;
        self
    }

    /// Require the superadmin role
    pub fn super_admin(mut self) -> Self {
        self.require_super_admin = true;
        self
    }

    /// Require a feature flag to be enabled
    pub fn feature(mut self, name: impl Into<String>) -> Self {
        self.required_feature = Some(name.into());
        self
    }

    /// Require access to a module
    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.required_module = Some(name.into());
        self
    }

    /// Require access to a tab of the required module
    pub fn tab(mut self, name: impl Into<String>) -> Self {
        self.required_tab = Some(name.into());
        self
    }

    /// `false` when a tab is named without its module
    pub fn is_well_formed(&self) -> bool {
        self.required_tab.is_none() || self.required_module.is_some()
    }

    /// Whether any legacy (role or flag) constraint is set
    pub fn has_legacy_constraints(&self) -> bool {
        self.require_admin || self.require_super_admin || self.required_feature.is_some()
    }
}

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// No valid session; terminal deny
    Unauthenticated,
    /// Session identity changed before permissions were loaded; terminal deny
    SessionChanged,
    /// Superadmin identity; every check skipped
    SuperadminBypass,
    /// Permission backend failed; permission predicate forced to false
    PermissionFetchError,
    /// Legacy role/flag predicate passed
    LegacyGranted,
    /// Only the granular permission predicate passed
    PermissionGranted,
    /// Neither model granted access
    Denied,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecisionReason::Unauthenticated => "unauthenticated",
            DecisionReason::SessionChanged => "session_changed",
            DecisionReason::SuperadminBypass => "superadmin_bypass",
            DecisionReason::PermissionFetchError => "permission_fetch_error",
            DecisionReason::LegacyGranted => "legacy_granted",
            DecisionReason::PermissionGranted => "permission_granted",
            DecisionReason::Denied => "denied",
        };
        f.write_str(s)
    }
}

/// Outcome of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Verdict of the role/flag model
    pub legacy_allowed: bool,
    /// Verdict of the module/tab model
    pub permission_allowed: bool,
}

impl AccessDecision {
    /// Terminal deny for a missing session
    pub fn unauthenticated() -> Self {
        Self {
            allowed: false,
            reason: DecisionReason::Unauthenticated,
            legacy_allowed: false,
            permission_allowed: false,
        }
    }

    /// Terminal deny for an evaluation whose session ended while it waited
    pub fn session_changed() -> Self {
        Self {
            reason: DecisionReason::SessionChanged,
            ..Self::unauthenticated()
        }
    }

    /// Unconditional allow for superadmins
    pub fn superadmin_bypass() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::SuperadminBypass,
            legacy_allowed: true,
            permission_allowed: true,
        }
    }

    /// OR-merge the two model verdicts
    ///
    /// When `fetch_failed` is set the permission verdict is forced to `false`
    /// and the reason records the failure, but the legacy verdict still applies.
    pub fn merge(legacy_allowed: bool, permission_allowed: bool, fetch_failed: bool) -> Self {
        let permission_allowed = permission_allowed && !fetch_failed;
        let allowed = legacy_allowed || permission_allowed;
        let reason = if fetch_failed {
            DecisionReason::PermissionFetchError
        } else if legacy_allowed {
            DecisionReason::LegacyGranted
        } else if permission_allowed {
            DecisionReason::PermissionGranted
        } else {
            DecisionReason::Denied
        };

        Self {
            allowed,
            reason,
            legacy_allowed,
            permission_allowed,
        }
    }
}

/// Granular permissions of one identity
///
/// A module is accessible when it has an entry; its value lists the tabs
/// accessible within it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub modules: BTreeMap<String, BTreeSet<String>>,
}

impl PermissionSet {
    /// Create an empty set (denies everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a module with no tabs
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.entry(module.into()).or_default();
        self
    }

    /// Grant a tab, granting its module as well
    pub fn with_tab(mut self, module: impl Into<String>, tab: impl Into<String>) -> Self {
        self.modules.entry(module.into()).or_default().insert(tab.into());
        self
    }

    pub fn can_access_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    pub fn can_access_tab(&self, module: &str, tab: &str) -> bool {
        self.modules
            .get(module)
            .map(|tabs| tabs.contains(tab))
            .unwrap_or(false)
    }

    /// Accessible module names
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Observable state exposed by a guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardState {
    /// Callers must not act on `allowed` while this is set
    pub loading: bool,
    pub allowed: bool,
    /// Reason of the decision, once decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionReason>,
}

impl GuardState {
    /// Nothing evaluated yet
    pub fn idle() -> Self {
        Self {
            loading: false,
            allowed: false,
            reason: None,
        }
    }

    /// Evaluation in progress
    pub fn loading() -> Self {
        Self {
            loading: true,
            allowed: false,
            reason: None,
        }
    }

    pub fn decided(decision: &AccessDecision) -> Self {
        Self {
            loading: false,
            allowed: decision.allowed,
            reason: Some(decision.reason),
        }
    }
}

impl Default for GuardState {
    fn default() -> Self {
        Self::idle()
    }
}
