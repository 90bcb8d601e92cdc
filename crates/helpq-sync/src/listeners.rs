use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

/// Stable token identifying one registration.
pub type ListenerId = u64;

struct Entry<L: ?Sized> {
    listener: Arc<L>,
    /// Pending entries are registered but not yet delivered to.
    active: bool,
}

struct RegistryInner<L: ?Sized> {
    next_id: ListenerId,
    entries: BTreeMap<ListenerId, Entry<L>>,
}

/// Listeners keyed by registration token, notified in registration order.
///
/// Removal goes by token, so registering the same callback twice yields two
/// independent registrations.
pub struct ListenerRegistry<L: ?Sized> {
    inner: Arc<Mutex<RegistryInner<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    /// Register an active listener.
    pub fn register(&self, listener: Arc<L>) -> Subscription {
        let id = self.insert(listener, true);
        self.subscription(id)
    }

    /// Register a listener that receives nothing until [`activate`](Self::activate).
    pub fn register_pending(&self, listener: Arc<L>) -> (ListenerId, Subscription) {
        let id = self.insert(listener, false);
        (id, self.subscription(id))
    }

    /// Mark a pending listener active. `None` if it was detached meanwhile.
    pub fn activate(&self, id: ListenerId) -> Option<Arc<L>> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&id)?;
        entry.active = true;
        Some(entry.listener.clone())
    }

    /// Active listeners in registration order. Callers invoke them after the
    /// registry lock is released, so a listener may detach itself.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.active)
            .map(|e| e.listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, listener: Arc<L>, active: bool) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Entry { listener, active });
        id
    }

    fn subscription(&self, id: ListenerId) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        let registry: Weak<dyn Detach> = weak;
        Subscription {
            handle: Handle::Listener { id, registry },
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: ListenerId);
}

impl<L: ?Sized + Send + Sync + 'static> Detach for Mutex<RegistryInner<L>> {
    fn detach(&self, id: ListenerId) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(&id);
    }
}

// ── Subscription ──

#[derive(Debug)]
enum Handle {
    Listener {
        id: ListenerId,
        registry: Weak<dyn Detach>,
    },
    Task(CancellationToken),
}

/// Handle detaching exactly one registration.
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to stop notifications. Unsubscribing
/// twice, or after the owning service is gone, does nothing.
#[derive(Debug)]
pub struct Subscription {
    handle: Handle,
}

impl Subscription {
    /// Subscription backed by a forwarding task; unsubscribing cancels it.
    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            handle: Handle::Task(token),
        }
    }

    pub fn unsubscribe(&self) {
        match &self.handle {
            Handle::Listener { id, registry } => {
                if let Some(registry) = registry.upgrade() {
                    registry.detach(*id);
                }
            }
            Handle::Task(token) => token.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Callback = dyn Fn(u32) + Send + Sync;

    fn emit(registry: &ListenerRegistry<Callback>, value: u32) {
        for l in registry.snapshot() {
            l(value);
        }
    }

    #[test]
    fn notifies_in_registration_order() {
        let registry = ListenerRegistry::<Callback>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            registry.register(Arc::new(move |v| seen.lock().unwrap().push((tag, v))));
        }
        emit(&registry, 7);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 7), ("second", 7), ("third", 7)]
        );
    }

    #[test]
    fn same_callback_twice_detaches_independently() {
        let registry = ListenerRegistry::<Callback>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let cb: Arc<Callback> = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let a = registry.register(cb.clone());
        let _b = registry.register(cb);

        a.unsubscribe();
        emit(&registry, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_survives_teardown() {
        let registry = ListenerRegistry::<Callback>::new();
        let sub = registry.register(Arc::new(|_| {}));
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(registry.is_empty());

        let late = registry.register(Arc::new(|_| {}));
        drop(registry);
        late.unsubscribe();
    }

    #[test]
    fn pending_listeners_are_skipped_until_activated() {
        let registry = ListenerRegistry::<Callback>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let (id, _sub) = registry.register_pending(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        emit(&registry, 1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(registry.activate(id).is_some());
        emit(&registry, 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_pending_listener_cannot_activate() {
        let registry = ListenerRegistry::<Callback>::new();
        let (id, sub) = registry.register_pending(Arc::new(|_| {}));
        sub.unsubscribe();
        assert!(registry.activate(id).is_none());
    }

    #[test]
    fn listener_may_detach_itself_during_emit() {
        let registry = ListenerRegistry::<Callback>::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let sub = registry.register(Arc::new(move |_| {
            if let Some(s) = inner.lock().unwrap().as_ref() {
                s.unsubscribe();
            }
        }));
        *slot.lock().unwrap() = Some(sub);
        emit(&registry, 1);
        assert!(registry.is_empty());
    }
}
