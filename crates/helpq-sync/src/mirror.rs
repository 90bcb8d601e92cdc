use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use helpq_core::{ClassroomQueue, ItemId};
use helpq_store::{Document, DocumentStore, Snapshot, StoreError};
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::listeners::{ListenerRegistry, Subscription};
use crate::mutator::QUEUE_FIELD;
use crate::tracker::SessionTracker;

type QueueListener = dyn Fn(Option<&ClassroomQueue>) + Send + Sync;

/// One decoded push: the sorted queue plus every pending item exactly as
/// the store holds it. `stored[i]` is the stored form of `queue.queue[i]`.
#[derive(Debug, Clone, PartialEq)]
struct Mirrored {
    queue: ClassroomQueue,
    stored: Vec<Value>,
}

impl Mirrored {
    fn decode(doc: &Document) -> Result<Self, StoreError> {
        let mut queue: ClassroomQueue = doc.decode()?;
        let stored = doc
            .data
            .get(QUEUE_FIELD)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if stored.len() != queue.queue.len() {
            return Err(StoreError::Decode {
                key: doc.id.clone(),
                message: "queue field is not a list of items".into(),
            });
        }
        let mut pairs: Vec<_> = std::mem::take(&mut queue.queue)
            .into_iter()
            .zip(stored)
            .collect();
        // Same stable key as `ClassroomQueue::sort_by_applied_at`.
        pairs.sort_by_key(|(item, _)| item.applied_at);
        let (items, stored): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        queue.queue = items;
        Ok(Self { queue, stored })
    }
}

/// What the mirror has seen of the remote queue document.
#[derive(Debug, Clone, Default)]
enum Synced {
    /// No push received yet.
    #[default]
    Waiting,
    /// Latest push, already sorted. `None` when the document is missing.
    Latest(Arc<Option<Mirrored>>),
}

struct MirrorInner {
    tracker: SessionTracker,
    /// Cache only; never held while listeners run.
    latest: Mutex<Synced>,
    /// Held for the whole of each delivery so listeners never see
    /// snapshots out of order. Accessors do not take it.
    delivery: Mutex<()>,
    listeners: ListenerRegistry<QueueListener>,
}

/// Local sorted copy of the current session's queue document.
///
/// Listeners may read the mirror (or anything built on it) from inside
/// their callback.
#[derive(Clone)]
pub struct RemoteMirror {
    inner: Arc<MirrorInner>,
}

impl RemoteMirror {
    pub fn new(tracker: SessionTracker) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                tracker,
                latest: Mutex::new(Synced::Waiting),
                delivery: Mutex::new(()),
                listeners: ListenerRegistry::new(),
            }),
        }
    }

    /// Latest sorted queue. `None` before the first push, or when the
    /// document does not exist.
    pub fn current(&self) -> Option<ClassroomQueue> {
        self.latest()
            .and_then(|latest| (*latest).as_ref().map(|m| m.queue.clone()))
    }

    /// The pending item with `id`, as stored remotely.
    pub(crate) fn stored_item(&self, id: &str) -> Option<Value> {
        let latest = self.latest()?;
        let mirrored = (*latest).as_ref()?;
        let index = mirrored.queue.queue.iter().position(|i| i.id == id)?;
        mirrored.stored.get(index).cloned()
    }

    /// Id and stored form of the head of the queue.
    pub(crate) fn stored_head(&self) -> Option<(ItemId, Value)> {
        let latest = self.latest()?;
        let mirrored = (*latest).as_ref()?;
        let head = mirrored.queue.head()?;
        Some((head.id.clone(), mirrored.stored.first()?.clone()))
    }

    /// Register for queue snapshots.
    ///
    /// Waits for the session lookup. `None` when there is no session; no
    /// queue events will ever be delivered in that case. Otherwise the
    /// callback first receives the latest snapshot (if one arrived
    /// already), then every later one.
    pub async fn on_queue_changed<F>(&self, callback: F) -> Option<Subscription>
    where
        F: Fn(Option<&ClassroomQueue>) + Send + Sync + 'static,
    {
        let tracker = &self.inner.tracker;
        tracker.await_ready().await;
        tracker.state().session()?;

        let delivery = self.lock_delivery();
        let (id, subscription) = self.inner.listeners.register_pending(Arc::new(callback));
        let latest = self.latest();
        if let Some(listener) = self.inner.listeners.activate(id) {
            if let Some(latest) = latest {
                listener((*latest).as_ref().map(|m| &m.queue));
            }
        }
        drop(delivery);
        Some(subscription)
    }

    /// Decode, sort and publish one push.
    pub(crate) fn apply(&self, snapshot: Snapshot) {
        let mirrored = match snapshot {
            Some(doc) => match Mirrored::decode(&doc) {
                Ok(mirrored) => Some(mirrored),
                Err(e) => {
                    warn!(error = %e, "ignoring undecodable queue snapshot");
                    return;
                }
            },
            None => None,
        };
        debug!(
            waiting = mirrored.as_ref().map_or(0, |m| m.queue.waiting()),
            exists = mirrored.is_some(),
            "queue snapshot"
        );

        let delivery = self.lock_delivery();
        let latest = Arc::new(mirrored);
        // The cache is the first consumer of every snapshot.
        *self.lock_latest() = Synced::Latest(latest.clone());
        let queue = (*latest).as_ref().map(|m| &m.queue);
        for listener in self.inner.listeners.snapshot() {
            listener(queue);
        }
        drop(delivery);
    }

    /// Follow the queue document of the resolved session until cancelled.
    /// Returns at once when there is no session.
    pub async fn run(
        self,
        store: Arc<dyn DocumentStore>,
        collection: String,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            _ = self.inner.tracker.await_ready() => {}
            _ = cancel.cancelled() => return,
        }
        let Some(session_id) = self.inner.tracker.state().session_id().map(str::to_string) else {
            debug!("no session; queue mirror idle");
            return;
        };

        let mut stream = match store.subscribe(&collection, &session_id).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session = %session_id, error = %e, "queue subscription failed");
                return;
            }
        };
        info!(session = %session_id, "following queue document");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                snapshot = stream.next() => match snapshot {
                    Some(snapshot) => self.apply(snapshot),
                    None => {
                        warn!(session = %session_id, "queue subscription closed by store");
                        break;
                    }
                },
            }
        }
        debug!("queue mirror stopped");
    }

    fn latest(&self) -> Option<Arc<Option<Mirrored>>> {
        match &*self.lock_latest() {
            Synced::Latest(latest) => Some(latest.clone()),
            Synced::Waiting => None,
        }
    }

    fn lock_latest(&self) -> MutexGuard<'_, Synced> {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.inner
            .delivery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpq_core::{ManualClock, QueueItem, Timestamp};
    use helpq_store::{Document, MemoryStore};
    use serde_json::json;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix_seconds(1_700_000_000 + secs).unwrap()
    }

    async fn resolved_mirror(with_session: bool) -> RemoteMirror {
        let store = MemoryStore::new();
        if with_session {
            store.set("class-time", "s1", json!({ "start": ts(0), "end": ts(3600) }));
        }
        let clock = ManualClock::new(ts(1));
        let tracker = SessionTracker::new(Arc::new(clock), CancellationToken::new());
        tracker.resolve(&store, "class-time").await;
        RemoteMirror::new(tracker)
    }

    fn queue_doc(items: &[(&str, i64)]) -> Snapshot {
        let queue: Vec<_> = items
            .iter()
            .map(|(id, at)| QueueItem::new(*id, format!("student-{id}"), ts(*at)))
            .collect();
        Some(Document {
            id: "s1".into(),
            data: json!({ "queue": queue, "resolved": [] }),
        })
    }

    fn ids(queue: &ClassroomQueue) -> Vec<String> {
        queue.queue.iter().map(|i| i.id.clone()).collect()
    }

    #[tokio::test]
    async fn no_session_means_no_subscription() {
        let mirror = resolved_mirror(false).await;
        assert!(mirror.on_queue_changed(|_| {}).await.is_none());
    }

    #[tokio::test]
    async fn snapshots_are_sorted_before_delivery() {
        let mirror = resolved_mirror(true).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = mirror
            .on_queue_changed(move |q| sink.lock().unwrap().push(q.map(ids)))
            .await;
        assert!(sub.is_some());

        mirror.apply(queue_doc(&[("a", 5), ("b", 2)]));
        mirror.apply(queue_doc(&[("c", 9), ("a", 5), ("b", 2)]));
        mirror.apply(None);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Some(vec!["b".to_string(), "a".to_string()]),
                Some(vec!["b".to_string(), "a".to_string(), "c".to_string()]),
                None,
            ]
        );
        assert_eq!(mirror.current(), None);
    }

    #[tokio::test]
    async fn late_listener_gets_latest_snapshot() {
        let mirror = resolved_mirror(true).await;
        mirror.apply(queue_doc(&[("a", 5), ("b", 2)]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mirror
            .on_queue_changed(move |q| sink.lock().unwrap().push(q.map(ids)))
            .await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(vec!["b".to_string(), "a".to_string()])]
        );
    }

    #[tokio::test]
    async fn stored_values_follow_sorted_order() {
        let mirror = resolved_mirror(true).await;
        mirror.apply(Some(Document {
            id: "s1".into(),
            data: json!({ "queue": [
                { "id": "late", "studentId": "x", "appliedAt": "2023-11-14T22:15:00.000Z" },
                { "id": "early", "studentId": "y", "appliedAt": "2023-11-14T22:10:00.000Z" }
            ] }),
        }));
        let (id, stored) = mirror.stored_head().unwrap();
        assert_eq!(id, "early");
        assert_eq!(stored["appliedAt"], "2023-11-14T22:10:00.000Z");
        assert_eq!(mirror.stored_item("late").unwrap()["id"], "late");
        assert!(mirror.stored_item("nobody").is_none());
    }

    #[tokio::test]
    async fn listener_can_read_mirror_during_delivery() {
        let mirror = resolved_mirror(true).await;
        mirror.apply(queue_doc(&[("a", 5)]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reader = mirror.clone();
        mirror
            .on_queue_changed(move |_| {
                let waiting = reader.current().map(|q| q.waiting());
                let head = reader.stored_head().map(|(id, _)| id);
                sink.lock().unwrap().push((waiting, head));
            })
            .await
            .unwrap();
        mirror.apply(queue_doc(&[("a", 5), ("b", 2)]));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some(1), Some("a".to_string())), (Some(2), Some("b".to_string()))]
        );
    }

    #[tokio::test]
    async fn undecodable_snapshot_keeps_previous_queue() {
        let mirror = resolved_mirror(true).await;
        mirror.apply(queue_doc(&[("a", 5)]));
        mirror.apply(Some(Document {
            id: "s1".into(),
            data: json!({ "queue": 12 }),
        }));
        assert_eq!(mirror.current().map(|q| ids(&q)), Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn unsubscribed_listener_stops_receiving() {
        let mirror = resolved_mirror(true).await;
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let sub = mirror
            .on_queue_changed(move |_| *sink.lock().unwrap() += 1)
            .await
            .unwrap();
        mirror.apply(queue_doc(&[("a", 1)]));
        sub.unsubscribe();
        sub.unsubscribe();
        mirror.apply(queue_doc(&[("b", 2)]));
        assert_eq!(*count.lock().unwrap(), 1);
        // Cache keeps following after listeners leave.
        assert_eq!(mirror.current().map(|q| ids(&q)), Some(vec!["b".to_string()]));
    }
}
