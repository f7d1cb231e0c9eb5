//! Memoizing, single-flight permission store

use access_gate_api::{PermissionSet, Role};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{PermissionBackend, PermissionError, PermissionsStore};
use crate::audit::{self, AuditSink};

type FetchResult = Result<Arc<PermissionSet>, PermissionError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct Flight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    loaded: HashMap<String, Arc<PermissionSet>>,
    in_flight: HashMap<String, Flight>,
    next_flight: u64,
}

/// [`PermissionsStore`] over any [`PermissionBackend`]
///
/// - One memoized [`PermissionSet`] per identity.
/// - Concurrent fetches for an identity join one shared in-flight future.
/// - A finished fetch installs its set only if it is still the latest flight
///   for that identity; a refresh or [`discard`](PermissionsStore::discard)
///   issued meanwhile wins.
/// - Failures are not memoized and leave any earlier set in place.
pub struct CachedPermissionsStore<B> {
    backend: Arc<B>,
    state: Arc<Mutex<CacheState>>,
    timeout: Option<Duration>,
    audit: Option<Arc<dyn AuditSink>>,
    fetches: AtomicU64,
}

impl<B: PermissionBackend + 'static> CachedPermissionsStore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            state: Arc::new(Mutex::new(CacheState::default())),
            timeout: None,
            audit: None,
            fetches: AtomicU64::new(0),
        }
    }

    /// Fail fetches that take longer than `limit`
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Number of backend fetches started so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Loaded set for an identity, if any
    pub fn permissions(&self, identity: &str) -> Option<Arc<PermissionSet>> {
        self.lock().loaded.get(identity).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new flight for `identity`, superseding any current one
    fn start_flight(&self, state: &mut CacheState, identity: &str, role: Role) -> SharedFetch {
        state.next_flight += 1;
        let id = state.next_flight;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.state);
        let timeout = self.timeout;
        let audit = self.audit.clone();
        let key = identity.to_string();
        let identity = identity.to_string();

        tracing::debug!(identity = %identity, role = %role, flight = id, "Fetching permissions");

        let fetch = async move {
            let result = match timeout {
                Some(limit) => tokio::time::timeout(limit, backend.fetch(&identity, role))
                    .await
                    .unwrap_or(Err(PermissionError::Timeout(limit))),
                None => backend.fetch(&identity, role).await,
            };
            let result = result.map(Arc::new);

            let installed = {
                let mut state = cache.lock().unwrap_or_else(PoisonError::into_inner);
                let latest = state.in_flight.get(&identity).map(|f| f.id) == Some(id);
                if latest {
                    state.in_flight.remove(&identity);
                    if let Ok(set) = &result {
                        state.loaded.insert(identity.clone(), Arc::clone(set));
                    }
                }
                latest
            };

            match &result {
                Ok(set) => {
                    tracing::debug!(identity = %identity, flight = id, modules = set.modules.len(), installed, "Permissions fetched");
                    audit::record_quietly(
                        audit.as_deref(),
                        audit::permissions_fetched(&identity, set.modules.len()),
                    );
                }
                Err(e) => {
                    tracing::warn!(identity = %identity, flight = id, error = %e, "Permission fetch failed");
                    audit::record_quietly(
                        audit.as_deref(),
                        audit::permission_fetch_failed(&identity, &e.to_string()),
                    );
                }
            }
            result
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key,
            Flight {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }
}

#[async_trait]
impl<B: PermissionBackend + 'static> PermissionsStore for CachedPermissionsStore<B> {
    async fn fetch_permissions(&self, identity: &str, role: Role) -> Result<(), PermissionError> {
        let fetch = {
            let mut state = self.lock();
            if state.loaded.contains_key(identity) {
                return Ok(());
            }
            match state.in_flight.get(identity) {
                Some(flight) => {
                    tracing::debug!(identity, flight = flight.id, "Joining in-flight permission fetch");
                    flight.fetch.clone()
                }
                None => self.start_flight(&mut state, identity, role),
            }
        };
        fetch.await.map(|_| ())
    }

    async fn refresh_permissions(
        &self,
        identity: &str,
        role: Role,
    ) -> Result<(), PermissionError> {
        let fetch = {
            let mut state = self.lock();
            self.start_flight(&mut state, identity, role)
        };
        fetch.await.map(|_| ())
    }

    fn can_access_module(&self, identity: &str, module: &str) -> bool {
        self.lock()
            .loaded
            .get(identity)
            .map(|set| set.can_access_module(module))
            .unwrap_or(false)
    }

    fn can_access_tab(&self, identity: &str, module: &str, tab: &str) -> bool {
        self.lock()
            .loaded
            .get(identity)
            .map(|set| set.can_access_tab(module, tab))
            .unwrap_or(false)
    }

    fn is_loaded(&self, identity: &str) -> bool {
        self.lock().loaded.contains_key(identity)
    }

    fn discard(&self, identity: &str) {
        let mut state = self.lock();
        let had_set = state.loaded.remove(identity).is_some();
        let had_flight = state.in_flight.remove(identity).is_some();
        if had_set || had_flight {
            tracing::debug!(identity, had_set, had_flight, "Discarded permissions");
        }
    }
}

impl<B> std::fmt::Debug for CachedPermissionsStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("CachedPermissionsStore")
            .field("loaded", &state.loaded.len())
            .field("in_flight", &state.in_flight.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
