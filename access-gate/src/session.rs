//! Session provider contract
//!
//! The identity provider lives outside this crate. The resolver only needs a
//! synchronous snapshot of who is signed in and how that identity is
//! classified.

use access_gate_api::{Role, Session};
use std::sync::{PoisonError, RwLock};

/// Classified view of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: Session,
    pub is_superadmin: bool,
    pub is_admin_or_above: bool,
}

impl SessionSnapshot {
    /// Classify a session from its role
    ///
    /// An unauthenticated session is never classified as privileged.
    pub fn from_session(session: Session) -> Self {
        let authenticated = session.authenticated;
        Self {
            is_superadmin: authenticated && session.role.is_superadmin(),
            is_admin_or_above: authenticated && session.role.is_admin_or_above(),
            session,
        }
    }

    pub fn identity(&self) -> &str {
        &self.session.identity
    }

    pub fn role(&self) -> Role {
        self.session.role
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.authenticated
    }
}

/// Source of the current session
///
/// Implementations must answer synchronously and cheaply; the resolver
/// calls this once per evaluation.
pub trait SessionProvider: Send + Sync {
    fn snapshot(&self) -> SessionSnapshot;
}

/// In-memory session provider
///
/// Embedding applications push login state into it; tests use it directly.
#[derive(Debug)]
pub struct StaticSessionProvider {
    session: RwLock<Session>,
}

impl StaticSessionProvider {
    pub fn new(session: Session) -> Self {
        Self {
            session: RwLock::new(session),
        }
    }

    /// Provider with nobody signed in
    pub fn anonymous() -> Self {
        Self::new(Session::anonymous())
    }

    pub fn sign_in(&self, identity: impl Into<String>, role: Role) {
        self.replace(Session::authenticated(identity, role));
    }

    pub fn sign_out(&self) {
        self.replace(Session::anonymous());
    }

    pub fn replace(&self, session: Session) {
        let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(identity = %session.identity, role = %session.role, authenticated = session.authenticated, "Session replaced");
        *current = session;
    }
}

impl Default for StaticSessionProvider {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl SessionProvider for StaticSessionProvider {
    fn snapshot(&self) -> SessionSnapshot {
        let session = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        SessionSnapshot::from_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_follows_role() {
        let snap = SessionSnapshot::from_session(Session::authenticated("u-1", Role::Admin));
        assert!(snap.is_admin_or_above);
        assert!(!snap.is_superadmin);

        let snap = SessionSnapshot::from_session(Session::authenticated("u-2", Role::SuperAdmin));
        assert!(snap.is_admin_or_above);
        assert!(snap.is_superadmin);
    }

    #[test]
    fn test_unauthenticated_is_never_privileged() {
        let session = Session {
            identity: "u-1".into(),
            role: Role::SuperAdmin,
            authenticated: false,
        };
        let snap = SessionSnapshot::from_session(session);
        assert!(!snap.is_superadmin);
        assert!(!snap.is_admin_or_above);
    }

    #[test]
    fn test_static_provider_sign_in_out() {
        let provider = StaticSessionProvider::anonymous();
        assert!(!provider.snapshot().is_authenticated());

        provider.sign_in("u-9", Role::Member);
        let snap = provider.snapshot();
        assert!(snap.is_authenticated());
        assert_eq!(snap.identity(), "u-9");
        assert_eq!(snap.role(), Role::Member);

        provider.sign_out();
        assert!(!provider.snapshot().is_authenticated());
    }
}
