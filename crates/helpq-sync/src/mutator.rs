use std::sync::Arc;

use helpq_core::{Clock, QueueItem, ResolvedItem};
use helpq_store::{DocumentStore, DocumentUpdate, StoreError};
use tracing::debug;

use crate::mirror::RemoteMirror;
use crate::tracker::SessionTracker;

pub const QUEUE_FIELD: &str = "queue";
pub const RESOLVED_FIELD: &str = "resolved";

/// Translates queue operations into set-style remote updates.
///
/// Every operation is a silent no-op (no remote call, `Ok(())`) without an
/// active session. Dequeue and resolve decisions use the mirror's latest
/// snapshot and remove the item value it recorded, so the store's by-value
/// set removal matches even when a stored timestamp is not in canonical
/// form. A stale snapshot removes nothing. Remote failures are returned as
/// is.
#[derive(Clone)]
pub struct QueueMutator {
    tracker: SessionTracker,
    mirror: RemoteMirror,
    store: Arc<dyn DocumentStore>,
    collection: String,
    clock: Arc<dyn Clock>,
}

impl QueueMutator {
    pub fn new(
        tracker: SessionTracker,
        mirror: RemoteMirror,
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            mirror,
            store,
            collection: collection.into(),
            clock,
        }
    }

    /// Add `item` to the pending queue. Adding an identical item again has
    /// no effect.
    pub async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError> {
        let Some(key) = self.queue_key() else {
            debug!(item = %item.id, "enqueue skipped: no session");
            return Ok(());
        };
        let update = DocumentUpdate::new().array_union(QUEUE_FIELD, item)?;
        self.store.update(&self.collection, &key, update).await
    }

    /// Remove the pending item with `id`, if the latest snapshot has it.
    /// The removal names the item exactly as the store holds it.
    pub async fn dequeue(&self, id: &str) -> Result<(), StoreError> {
        let Some(stored) = self.mirror.stored_item(id) else {
            debug!(item = id, "dequeue skipped: item not pending");
            return Ok(());
        };
        let Some(key) = self.queue_key() else {
            return Ok(());
        };
        let update = DocumentUpdate::new().array_remove(QUEUE_FIELD, &stored)?;
        self.store.update(&self.collection, &key, update).await
    }

    /// Resolve the head of the queue: one request that removes it from
    /// `queue` and records it in `resolved`.
    pub async fn dequeue_and_enqueue_resolved(&self, points: i64) -> Result<(), StoreError> {
        let Some((id, stored)) = self.mirror.stored_head() else {
            debug!("resolve skipped: queue empty or not synced");
            return Ok(());
        };
        let Some(key) = self.queue_key() else {
            return Ok(());
        };
        let resolved = ResolvedItem {
            id,
            points,
            resolved_at: self.clock.now(),
        };
        let update = DocumentUpdate::new()
            .array_remove(QUEUE_FIELD, &stored)?
            .array_union(RESOLVED_FIELD, &resolved)?;
        self.store.update(&self.collection, &key, update).await
    }

    /// Record a resolution for any id, pending or not. The queue is untouched.
    pub async fn enqueue_resolve(&self, id: &str, points: i64) -> Result<(), StoreError> {
        let Some(key) = self.queue_key() else {
            debug!(item = id, "resolve skipped: no session");
            return Ok(());
        };
        let resolved = ResolvedItem {
            id: id.to_string(),
            points,
            resolved_at: self.clock.now(),
        };
        let update = DocumentUpdate::new().array_union(RESOLVED_FIELD, &resolved)?;
        self.store.update(&self.collection, &key, update).await
    }

    /// The queue document key is the session id.
    fn queue_key(&self) -> Option<String> {
        self.tracker.state().session_id().map(str::to_string)
    }
}
