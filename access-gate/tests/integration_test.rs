//! End-to-end checks of resolver, guard and flag store behaviour

use access_gate::{
    AccessRequest, AccessResolver, CachedPermissionsStore, DecisionReason, FeatureFlagStore,
    FlagDefaults, GuardState, MemoryStorage, PermissionBackend, PermissionError, PermissionSet,
    Role, StaticSessionProvider, FEATURE_FLAGS_KEY,
};
use access_gate::{Guard, KeyValueStorage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Backend double that counts fetches and answers after a short delay
struct CountingBackend {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingBackend {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionBackend for CountingBackend {
    async fn fetch(&self, _identity: &str, _role: Role) -> Result<PermissionSet, PermissionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail {
            return Err(PermissionError::Backend("service unavailable".into()));
        }
        Ok(PermissionSet::new()
            .with_module("m")
            .with_tab("reports", "summary"))
    }
}

struct Fixture {
    session: Arc<StaticSessionProvider>,
    backend: Arc<CountingBackend>,
    resolver: AccessResolver,
}

fn fixture(backend: Arc<CountingBackend>) -> Fixture {
    let session = Arc::new(StaticSessionProvider::anonymous());
    let flags = Arc::new(FeatureFlagStore::open(
        Arc::new(MemoryStorage::new()),
        FlagDefaults::standard().with("x", false),
    ));
    let permissions = Arc::new(CachedPermissionsStore::new(backend.clone()));
    let resolver = AccessResolver::new(session.clone(), flags, permissions);
    Fixture {
        session,
        backend,
        resolver,
    }
}

fn descriptors() -> Vec<AccessRequest> {
    vec![
        AccessRequest::new(),
        AccessRequest::new().admin(),
        AccessRequest::new().super_admin(),
        AccessRequest::new().feature("x"),
        AccessRequest::new().feature("unknown_flag"),
        AccessRequest::new().module("billing"),
        AccessRequest::new().module("reports").tab("export"),
        AccessRequest::new().super_admin().feature("x").module("nope").tab("nope"),
    ]
}

#[tokio::test]
async fn test_superadmin_is_always_allowed() {
    for backend in [CountingBackend::ok(), CountingBackend::failing()] {
        let f = fixture(backend);
        f.session.sign_in("root", Role::SuperAdmin);

        for request in descriptors() {
            let decision = f.resolver.evaluate(&request).await;
            assert!(decision.allowed, "request: {:?}", request);
            assert_eq!(decision.reason, DecisionReason::SuperadminBypass);
        }
        assert_eq!(f.backend.calls(), 0);
    }
}

#[tokio::test]
async fn test_unauthenticated_is_denied_without_fetching() {
    let f = fixture(CountingBackend::ok());
    let guard = Guard::new(f.resolver.clone());

    for request in descriptors() {
        let state = guard.evaluate(request);
        assert!(!state.loading);
        assert!(!state.allowed);
    }
    assert_eq!(f.backend.calls(), 0);
}

#[tokio::test]
async fn test_permission_model_overrides_legacy_denial() {
    let f = fixture(CountingBackend::ok());
    f.session.sign_in("u-1", Role::Member);
    assert!(!f.resolver.flags().get("x"));

    let decision = f
        .resolver
        .evaluate(&AccessRequest::new().admin().feature("x").module("m"))
        .await;
    assert!(decision.allowed);
}

#[tokio::test]
async fn test_fetch_failure_falls_back_to_unconstrained_legacy() {
    let f = fixture(CountingBackend::failing());
    f.session.sign_in("u-1", Role::Member);

    let decision = f.resolver.evaluate(&AccessRequest::new().module("m")).await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, DecisionReason::PermissionFetchError);
}

#[tokio::test]
async fn test_concurrent_evaluations_share_one_fetch() {
    let f = fixture(CountingBackend::ok());
    f.session.sign_in("u-1", Role::Member);

    let a = AccessRequest::new().admin().module("m");
    let b = AccessRequest::new().admin().module("reports").tab("summary");
    let (first, second) = tokio::join!(f.resolver.evaluate(&a), f.resolver.evaluate(&b));

    assert!(first.allowed);
    assert!(second.allowed);
    assert_eq!(f.backend.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_guards_share_one_fetch() {
    let f = fixture(CountingBackend::ok());
    f.session.sign_in("u-1", Role::Member);

    let guards: Vec<Guard> = (0..4).map(|_| Guard::new(f.resolver.clone())).collect();
    for guard in &guards {
        assert!(guard.evaluate(AccessRequest::new().admin().module("m")).loading);
    }
    for guard in &guards {
        let state = guard.settled().await;
        assert!(state.allowed);
    }
    assert_eq!(f.backend.calls(), 1);
}

#[tokio::test]
async fn test_repeated_evaluation_is_identical() {
    let f = fixture(CountingBackend::ok());
    f.session.sign_in("u-1", Role::Manager);

    for request in descriptors() {
        let first = f.resolver.evaluate(&request).await;
        let second = f.resolver.evaluate(&request).await;
        assert_eq!(first, second, "request: {:?}", request);
    }
}

#[tokio::test]
async fn test_guard_always_stops_loading() {
    for backend in [CountingBackend::ok(), CountingBackend::failing()] {
        let f = fixture(backend);
        f.session.sign_in("u-1", Role::Member);
        let guard = Guard::new(f.resolver.clone());

        guard.evaluate(AccessRequest::new().admin().module("billing"));
        let state = tokio::time::timeout(Duration::from_secs(5), guard.settled())
            .await
            .expect("guard never settled");
        assert!(!state.loading);
        assert!(!state.allowed);
    }
}

#[test]
fn test_reset_then_load_yields_defaults() {
    let storage = Arc::new(
        MemoryStorage::new().with_entry(FEATURE_FLAGS_KEY, r#"{"beta_features":true}"#),
    );
    let store = FeatureFlagStore::open(storage, FlagDefaults::standard());
    assert!(store.get("beta_features"));

    store.reset_to_defaults().unwrap();
    store.load();
    assert_eq!(&store.flags(), FlagDefaults::standard().as_map());
}

#[test]
fn test_blob_missing_a_default_key_is_filled() -> anyhow::Result<()> {
    let storage = Arc::new(MemoryStorage::new().with_entry(
        FEATURE_FLAGS_KEY,
        r#"{"analytics_dashboard":false,"export_reports":false,"widget_reordering":true,
            "realtime_updates":true,"beta_features":true,"legacy_grid":true}"#,
    ));
    let store = FeatureFlagStore::open(storage.clone(), FlagDefaults::standard());

    let flags = store.flags();
    // Filled from defaults
    assert_eq!(flags.get("advanced_charts"), Some(&false));
    // Persisted values kept as-is
    assert_eq!(flags.get("analytics_dashboard"), Some(&false));
    assert_eq!(flags.get("realtime_updates"), Some(&true));
    assert_eq!(flags.get("legacy_grid"), Some(&true));

    // The next write persists the merged map
    store.toggle("advanced_charts")?;
    let blob = storage.get(FEATURE_FLAGS_KEY)?.unwrap_or_default();
    assert!(blob.contains("\"advanced_charts\":true"));
    assert!(blob.contains("\"legacy_grid\":true"));
    Ok(())
}

#[tokio::test]
async fn test_initial_guard_state_is_idle() {
    let f = fixture(CountingBackend::ok());
    let guard = Guard::new(f.resolver.clone());
    assert_eq!(guard.state(), GuardState::idle());
}

#[tokio::test]
async fn test_pending_guard_does_not_reload_previous_identity() {
    let f = fixture(CountingBackend::ok());
    f.session.sign_in("u-1", Role::Member);
    let guard = Guard::new(f.resolver.clone());
    let request = AccessRequest::new().admin().module("m");
    assert!(guard.evaluate(request.clone()).loading);

    f.session.sign_in("u-2", Role::Member);
    assert!(f.resolver.evaluate(&request).await.allowed);

    let state = guard.settled().await;
    assert!(!state.allowed);
    assert_eq!(state.reason, Some(DecisionReason::SessionChanged));
    assert!(!f.resolver.permissions().is_loaded("u-1"));
    assert_eq!(f.backend.calls(), 1);
}
