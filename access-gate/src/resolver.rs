//! Access decision engine
//!
//! Evaluates one [`AccessRequest`] against the current session by running the
//! legacy role/flag predicate and the granular module/tab predicate, then
//! OR-merging them.
//!
//! # State machine
//!
//! ```text
//!               not authenticated / superadmin
//! Unevaluated ─────────────────────────────────────────▶ Decided
//!      │                                                   ▲
//!      │ otherwise: fetch (or join) permissions            │ fetch settled
//!      ▼                                                   │ (ok or error)
//!   Loading ───────────────────────────────────────────────┘
//! ```
//!
//! An evaluation still loading when the session switches identity settles
//! as a `SessionChanged` deny and leaves no permissions behind for the old
//! identity.
//!
//! # OR-merge
//!
//! Access is granted when *either* model grants it. This bridges the
//! migration from roles and flags to granular permissions and is
//! deliberately permissive: a request with no legacy constraints passes the
//! legacy predicate and is therefore always allowed, whatever the permission
//! model says.

use access_gate_api::{AccessDecision, AccessRequest};
use std::sync::{Arc, Mutex, PoisonError};

use crate::audit::{self, AuditSink};
use crate::flags::FeatureFlagStore;
use crate::permissions::PermissionsStore;
use crate::session::{SessionProvider, SessionSnapshot};

/// Observable progress of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluationState {
    /// No request issued yet
    #[default]
    Unevaluated,
    Loading,
    Decided(AccessDecision),
}

/// Result of starting an evaluation
#[derive(Debug)]
pub enum Evaluation {
    /// Decided without touching permissions (rules 1 and 2)
    Decided(AccessDecision),
    /// Waiting for permissions; finish with [`PendingEvaluation::settle`]
    Loading(PendingEvaluation),
}

impl Evaluation {
    pub fn state(&self) -> EvaluationState {
        match self {
            Evaluation::Decided(decision) => EvaluationState::Decided(*decision),
            Evaluation::Loading(_) => EvaluationState::Loading,
        }
    }
}

/// Evaluation parked in `Loading`
///
/// Owns everything it needs, so it can be moved onto a task.
pub struct PendingEvaluation {
    resolver: AccessResolver,
    snapshot: SessionSnapshot,
    request: AccessRequest,
}

impl PendingEvaluation {
    pub fn identity(&self) -> &str {
        self.snapshot.identity()
    }

    pub fn request(&self) -> &AccessRequest {
        &self.request
    }

    /// Wait for permissions and decide
    ///
    /// A failed fetch forces the permission verdict to `false`; the legacy
    /// verdict and the OR-merge still apply. If the session moved to another
    /// identity before the permissions arrived the evaluation ends in
    /// [`DecisionReason::SessionChanged`](access_gate_api::DecisionReason)
    /// and nothing stays loaded for the old identity.
    pub async fn settle(self) -> AccessDecision {
        let resolver = &self.resolver;
        let identity = self.snapshot.identity();

        if !resolver.is_current(identity) {
            tracing::debug!(identity, "Session changed before permissions were requested");
            return resolver.finish(identity, &self.request, AccessDecision::session_changed());
        }

        let fetch = resolver
            .permissions
            .fetch_permissions(identity, self.snapshot.role())
            .await;

        if !resolver.is_current(identity) {
            // The flight may have installed after the switch discarded it
            resolver.permissions.discard(identity);
            tracing::debug!(identity, "Session changed while permissions were loading");
            return resolver.finish(identity, &self.request, AccessDecision::session_changed());
        }

        let fetch_failed = match fetch {
            Ok(()) => false,
            Err(e) => {
                tracing::debug!(identity, error = %e, "Evaluating with permission model failed closed");
                true
            }
        };

        let legacy_allowed = resolver.legacy_allowed(&self.snapshot, &self.request);
        let permission_allowed = !fetch_failed && resolver.permission_allowed(identity, &self.request);

        let decision = AccessDecision::merge(legacy_allowed, permission_allowed, fetch_failed);
        resolver.finish(identity, &self.request, decision)
    }
}

impl std::fmt::Debug for PendingEvaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEvaluation")
            .field("identity", &self.snapshot.identity())
            .field("request", &self.request)
            .finish()
    }
}

/// Access decision engine
///
/// Cheap to clone; clones share the injected stores. No decision is cached
/// between requests.
#[derive(Clone)]
pub struct AccessResolver {
    session: Arc<dyn SessionProvider>,
    flags: Arc<FeatureFlagStore>,
    permissions: Arc<dyn PermissionsStore>,
    audit: Option<Arc<dyn AuditSink>>,
    last_identity: Arc<Mutex<Option<String>>>,
}

impl AccessResolver {
    pub fn new(
        session: Arc<dyn SessionProvider>,
        flags: Arc<FeatureFlagStore>,
        permissions: Arc<dyn PermissionsStore>,
    ) -> Self {
        Self {
            session,
            flags,
            permissions,
            audit: None,
            last_identity: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn flags(&self) -> &Arc<FeatureFlagStore> {
        &self.flags
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionsStore> {
        &self.permissions
    }

    /// Start an evaluation from `Unevaluated` for the current session
    pub fn begin(&self, request: &AccessRequest) -> Evaluation {
        self.begin_with(self.session.snapshot(), request)
    }

    /// Start an evaluation for a session snapshot the caller already took
    ///
    /// Callers that key state on the identity must pass the same snapshot
    /// they keyed on, so the decision can never belong to a later session.
    pub fn begin_with(&self, snapshot: SessionSnapshot, request: &AccessRequest) -> Evaluation {
        if !snapshot.is_authenticated() {
            self.observe_identity(None);
            let decision = self.finish(snapshot.identity(), request, AccessDecision::unauthenticated());
            return Evaluation::Decided(decision);
        }

        self.observe_identity(Some(snapshot.identity()));

        if snapshot.is_superadmin {
            let decision = self.finish(snapshot.identity(), request, AccessDecision::superadmin_bypass());
            return Evaluation::Decided(decision);
        }

        if !request.is_well_formed() {
            tracing::warn!(identity = snapshot.identity(), tab = ?request.required_tab, "Ignoring tab requirement without a module");
        }

        tracing::debug!(identity = snapshot.identity(), request = ?request, "Evaluation loading permissions");
        Evaluation::Loading(PendingEvaluation {
            resolver: self.clone(),
            snapshot,
            request: request.clone(),
        })
    }

    /// Evaluate a request to completion
    pub async fn evaluate(&self, request: &AccessRequest) -> AccessDecision {
        match self.begin(request) {
            Evaluation::Decided(decision) => decision,
            Evaluation::Loading(pending) => pending.settle().await,
        }
    }

    fn legacy_allowed(&self, snapshot: &SessionSnapshot, request: &AccessRequest) -> bool {
        let mut allowed = true;
        if request.require_super_admin && !snapshot.is_superadmin {
            allowed = false;
        } else if request.require_admin && !snapshot.is_admin_or_above {
            allowed = false;
        }
        if let Some(feature) = &request.required_feature {
            if !snapshot.is_superadmin && !self.flags.get(feature) {
                allowed = false;
            }
        }
        allowed
    }

    fn permission_allowed(&self, identity: &str, request: &AccessRequest) -> bool {
        let Some(module) = &request.required_module else {
            return true;
        };
        let mut allowed = self.permissions.can_access_module(identity, module);
        if allowed {
            if let Some(tab) = &request.required_tab {
                allowed = self.permissions.can_access_tab(identity, module, tab);
            }
        }
        allowed
    }

    fn finish(&self, identity: &str, request: &AccessRequest, decision: AccessDecision) -> AccessDecision {
        tracing::debug!(
            identity,
            allowed = decision.allowed,
            reason = %decision.reason,
            legacy = decision.legacy_allowed,
            permission = decision.permission_allowed,
            "Access decided"
        );
        audit::record_quietly(
            self.audit.as_deref(),
            audit::access_decided(identity, request, &decision),
        );
        decision
    }

    fn is_current(&self, identity: &str) -> bool {
        self.last_identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(identity)
    }

    /// Discard the previous identity's permissions when the session changes
    fn observe_identity(&self, identity: Option<&str>) {
        let mut last = self
            .last_identity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() == identity {
            return;
        }
        if let Some(previous) = last.take() {
            tracing::info!(previous = %previous, current = ?identity, "Session identity changed");
            self.permissions.discard(&previous);
        }
        *last = identity.map(str::to_string);
    }
}

impl std::fmt::Debug for AccessResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessResolver")
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
