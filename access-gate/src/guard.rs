//! Guard: the consumer-facing `{loading, allowed}` view of the resolver
//!
//! A guard runs one evaluation per distinct (identity, request) pair and
//! publishes its progress on a `watch` channel. Re-evaluation is triggered
//! only when the identity or the request changes.
//!
//! Ordering: every evaluation takes a generation number; only the latest
//! generation may publish, so a slow evaluation superseded by a newer request
//! can never overwrite the newer result. A superseded evaluation's task is
//! aborted, and after [`Guard::teardown`] nothing runs or is published at all.

use access_gate_api::{AccessRequest, GuardState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::resolver::{AccessResolver, Evaluation, EvaluationState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct GuardKey {
    /// `None` while unauthenticated
    identity: Option<String>,
    request: AccessRequest,
}

#[derive(Debug, Default)]
struct Tracker {
    key: Option<GuardKey>,
    generation: u64,
    evaluation: EvaluationState,
    /// Task settling the current generation, if it is still loading
    task: Option<AbortHandle>,
}

impl Tracker {
    /// Move to a new generation, aborting the previous one's task
    fn advance(&mut self, key: Option<GuardKey>) -> u64 {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
        self.key = key;
        self.evaluation = EvaluationState::Unevaluated;
        self.generation
    }
}

struct GuardInner {
    tracker: Mutex<Tracker>,
    state: watch::Sender<GuardState>,
    torn_down: AtomicBool,
}

impl GuardInner {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish if `generation` is still current
    fn publish(&self, generation: u64, evaluation: EvaluationState) -> bool {
        let mut tracker = self.tracker();
        if self.torn_down.load(Ordering::SeqCst) || tracker.generation != generation {
            tracing::debug!(generation, current = tracker.generation, "Dropping stale guard state");
            return false;
        }
        let state = match evaluation {
            EvaluationState::Unevaluated => GuardState::idle(),
            EvaluationState::Loading => GuardState::loading(),
            EvaluationState::Decided(decision) => {
                tracker.task = None;
                GuardState::decided(&decision)
            }
        };
        tracker.evaluation = evaluation;
        self.state.send_replace(state);
        true
    }
}

/// Gate for one logical consumer (a page, a route, an RPC handler)
///
/// Must be used from within a tokio runtime: evaluations that need to load
/// permissions finish on a spawned task.
pub struct Guard {
    resolver: AccessResolver,
    inner: Arc<GuardInner>,
}

impl Guard {
    pub fn new(resolver: AccessResolver) -> Self {
        let (state, _) = watch::channel(GuardState::idle());
        Self {
            resolver,
            inner: Arc::new(GuardInner {
                tracker: Mutex::new(Tracker::default()),
                state,
                torn_down: AtomicBool::new(false),
            }),
        }
    }

    /// Evaluate `request` for the current session
    ///
    /// Returns the state right away: decided when the answer needs no
    /// permissions (unauthenticated, superadmin), otherwise loading. Calling
    /// again with the same request and identity does not re-evaluate.
    pub fn evaluate(&self, request: AccessRequest) -> GuardState {
        if self.inner.torn_down.load(Ordering::SeqCst) {
            return self.state();
        }

        // One snapshot keys the guard and drives the evaluation
        let snapshot = self.resolver.session();
        let key = GuardKey {
            identity: snapshot
                .is_authenticated()
                .then(|| snapshot.identity().to_string()),
            request,
        };

        let generation = {
            let mut tracker = self.inner.tracker();
            if tracker.key.as_ref() == Some(&key) {
                return self.state();
            }
            tracker.advance(Some(key.clone()))
        };

        match self.resolver.begin_with(snapshot, &key.request) {
            Evaluation::Decided(decision) => {
                self.inner.publish(generation, EvaluationState::Decided(decision));
            }
            Evaluation::Loading(pending) => {
                if !self.inner.publish(generation, EvaluationState::Loading) {
                    return self.state();
                }

                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let decision = pending.settle().await;
                    inner.publish(generation, EvaluationState::Decided(decision));
                });

                let mut tracker = self.inner.tracker();
                if tracker.generation == generation && tracker.evaluation == EvaluationState::Loading {
                    tracker.task = Some(task.abort_handle());
                }
            }
        }
        self.state()
    }

    /// Re-evaluate the current request if the session identity changed
    pub fn refresh(&self) -> GuardState {
        let request = self.inner.tracker().key.as_ref().map(|k| k.request.clone());
        match request {
            Some(request) => self.evaluate(request),
            None => self.state(),
        }
    }

    /// Current state
    pub fn state(&self) -> GuardState {
        *self.inner.state.borrow()
    }

    /// Progress of the current evaluation, including its full decision
    pub fn evaluation(&self) -> EvaluationState {
        self.inner.tracker().evaluation
    }

    pub fn subscribe(&self) -> watch::Receiver<GuardState> {
        self.inner.state.subscribe()
    }

    /// Wait until the current evaluation is no longer loading
    pub async fn settled(&self) -> GuardState {
        let mut rx = self.subscribe();
        let settled = match rx.wait_for(|state| !state.loading).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// Stop publishing and abort any in-flight evaluation
    ///
    /// The guard settles on a non-loading deny so observers never hang.
    pub fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tracker = self.inner.tracker();
        tracker.advance(None);
        self.inner.state.send_replace(GuardState::idle());
        tracing::debug!("Guard torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("state", &self.state())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}
