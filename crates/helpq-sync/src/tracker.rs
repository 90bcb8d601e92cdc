use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use helpq_core::{ClassSession, Clock, SessionState, SessionWindow, Timestamp};
use helpq_store::{Document, DocumentStore, Filter, Snapshot, SnapshotStream};
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gate::ReadinessGate;
use crate::listeners::{ListenerRegistry, Subscription};

/// Delivered to session listeners: liveness plus the window it was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub is_live: bool,
    pub window: Option<SessionWindow>,
}

type SessionListener = dyn Fn(&SessionEvent) + Send + Sync;

struct TrackerInner {
    clock: Arc<dyn Clock>,
    state: RwLock<SessionState>,
    /// Last liveness value delivered. Held while emitting, so deliveries
    /// never interleave.
    last_live: Mutex<bool>,
    lookup_started: AtomicBool,
    ready: ReadinessGate,
    listeners: ListenerRegistry<SessionListener>,
    cancel: CancellationToken,
}

/// Owns the cached session window and edge-triggers liveness changes.
///
/// States go `Unresolved -> Absent | Present`, exactly once, via
/// [`resolve`](Self::resolve). While `Present`, pushes for the same session
/// refresh the window in place.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<TrackerInner>,
}

impl SessionTracker {
    pub fn new(clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                clock,
                state: RwLock::new(SessionState::Unresolved),
                last_live: Mutex::new(false),
                lookup_started: AtomicBool::new(false),
                ready: ReadinessGate::new(),
                listeners: ListenerRegistry::new(),
                cancel,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live(self.inner.clock.now())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.is_open()
    }

    /// Resolves once the one-time lookup has completed.
    pub async fn await_ready(&self) {
        self.inner.ready.wait().await;
    }

    /// One-time session lookup. Later calls wait for the first one instead
    /// of querying again.
    pub async fn resolve(&self, store: &dyn DocumentStore, collection: &str) -> SessionState {
        if self.inner.lookup_started.swap(true, Ordering::SeqCst) {
            self.await_ready().await;
            return self.state();
        }

        let now = self.inner.clock.now();
        let state = match store
            .query(collection, &Filter::timestamp_at_least("end", now))
            .await
        {
            Ok(docs) => select_session(&docs, now),
            Err(e) => {
                error!(collection, error = %e, "session lookup failed; treating session as absent");
                SessionState::Absent
            }
        };
        self.settle(state.clone());
        state
    }

    fn settle(&self, state: SessionState) {
        match &state {
            SessionState::Present(s) => info!(
                session = %s.id,
                start = %s.window.start,
                end = %s.window.end,
                "session resolved"
            ),
            _ => info!("no active session"),
        }
        *self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;

        let mut last = self.lock_last_live();
        *last = self.is_live();
        drop(last);
        self.inner.ready.open();
    }

    /// Recompute liveness and notify listeners if it changed.
    pub(crate) fn tick(&self) -> Option<SessionEvent> {
        let mut last = self.lock_last_live();
        let state = self.state();
        let live = state.is_live(self.inner.clock.now());
        if live == *last {
            return None;
        }
        *last = live;

        let event = SessionEvent {
            is_live: live,
            window: state.window().copied(),
        };
        info!(live, session = state.session_id().unwrap_or("-"), "session liveness changed");
        for listener in self.inner.listeners.snapshot() {
            listener(&event);
        }
        Some(event)
    }

    /// Replace the cached window when a push for the current session arrives.
    pub(crate) fn refresh(&self, snapshot: Snapshot) {
        let Some(doc) = snapshot else {
            warn!("session document disappeared; keeping last known window");
            return;
        };
        let window = match doc.decode::<SessionWindow>() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable session update");
                return;
            }
        };
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let SessionState::Present(session) = &mut *state {
            if session.id == doc.id && session.window != window {
                debug!(session = %session.id, "session window refreshed");
                session.window = window;
            }
        }
    }

    /// Register for liveness events.
    ///
    /// Once the lookup has completed the callback gets one event with the
    /// current liveness, then one per change. Events arrive in registration
    /// order across listeners.
    ///
    /// The initial event is delivered from a spawned task, so this must be
    /// called within a tokio runtime context (inside a task, or under
    /// [`Handle::enter`](tokio::runtime::Handle::enter) from sync code).
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn on_session_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let (id, subscription) = self.inner.listeners.register_pending(Arc::new(callback));
        let tracker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tracker.await_ready() => {}
                _ = tracker.inner.cancel.cancelled() => return,
            }
            let last = tracker.lock_last_live();
            let event = SessionEvent {
                is_live: *last,
                window: tracker.state().window().copied(),
            };
            if let Some(listener) = tracker.inner.listeners.activate(id) {
                listener(&event);
            }
            drop(last);
        });
        subscription
    }

    /// Lookup, then tick and follow session pushes until cancelled.
    pub async fn run(self, store: Arc<dyn DocumentStore>, collection: String, tick: Duration) {
        let cancel = self.inner.cancel.clone();
        let state = tokio::select! {
            state = self.resolve(store.as_ref(), &collection) => state,
            _ = cancel.cancelled() => return,
        };

        let mut updates = match state.session_id() {
            Some(id) => match store.subscribe(&collection, id).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(session = id, error = %e, "cannot follow session document");
                    None
                }
            },
            None => None,
        };

        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
                snapshot = next_snapshot(&mut updates) => match snapshot {
                    Some(snapshot) => self.refresh(snapshot),
                    None => {
                        debug!("session document stream ended");
                        updates = None;
                    }
                },
            }
        }
        debug!("session tracker stopped");
    }

    fn lock_last_live(&self) -> MutexGuard<'_, bool> {
        self.inner
            .last_live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn next_snapshot(stream: &mut Option<SnapshotStream>) -> Option<Snapshot> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Pick the started window with the latest start; ties go to the greatest id.
fn select_session(docs: &[Document], now: Timestamp) -> SessionState {
    docs.iter()
        .filter_map(|doc| match doc.decode::<SessionWindow>() {
            Ok(window) => Some(ClassSession {
                id: doc.id.clone(),
                window,
            }),
            Err(e) => {
                warn!(error = %e, "skipping undecodable session document");
                None
            }
        })
        .filter(|s| s.window.start <= now)
        .max_by(|a, b| {
            a.window
                .start
                .cmp(&b.window.start)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map_or(SessionState::Absent, SessionState::Present)
}
