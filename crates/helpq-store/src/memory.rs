use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::{
    Document, DocumentStore, DocumentUpdate, FieldOp, Filter, SnapshotStream, StoreError,
};

type Collections = HashMap<String, BTreeMap<String, watch::Sender<Option<Value>>>>;

/// In-process document store with push subscriptions.
///
/// Each document lives in a `watch` channel, so subscribers always see the
/// latest full snapshot. Intermediate versions may be skipped by slow
/// subscribers, the way a remote store coalesces pushes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<Collections>,
    query_calls: AtomicUsize,
    update_calls: AtomicUsize,
    fail_updates: Mutex<Option<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `{ "<collection>": { "<key>": <document>, ... }, ... }`.
    pub fn from_seed(seed: &Value) -> Result<Self, StoreError> {
        let store = Self::new();
        let Some(collections) = seed.as_object() else {
            return Err(StoreError::Decode {
                key: "<seed>".into(),
                message: "seed must be an object of collections".into(),
            });
        };
        for (collection, docs) in collections {
            let Some(docs) = docs.as_object() else {
                return Err(StoreError::Decode {
                    key: collection.clone(),
                    message: "collection must be an object of documents".into(),
                });
            };
            for (key, data) in docs {
                store.set(collection, key, data.clone());
            }
        }
        Ok(store)
    }

    /// Create or overwrite a document, notifying subscribers.
    pub fn set(&self, collection: &str, key: &str, data: Value) {
        let mut collections = self.lock();
        let sender = slot(&mut collections, collection, key);
        sender.send_replace(Some(data));
    }

    /// Delete a document, notifying subscribers with a missing snapshot.
    pub fn delete(&self, collection: &str, key: &str) {
        let collections = self.lock();
        if let Some(sender) = collections.get(collection).and_then(|c| c.get(key)) {
            sender.send_replace(None);
        }
    }

    /// Current body of a document, bypassing the async contract.
    pub fn peek(&self, collection: &str, key: &str) -> Option<Value> {
        let collections = self.lock();
        collections
            .get(collection)
            .and_then(|c| c.get(key))
            .and_then(|sender| sender.borrow().clone())
    }

    /// Number of `query` calls served so far.
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls received so far, failed ones included.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Make every later `update` fail with `err`. `None` restores normal writes.
    pub fn fail_updates_with(&self, err: Option<StoreError>) {
        *self
            .fail_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = err;
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.collections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn slot<'a>(
    collections: &'a mut Collections,
    collection: &str,
    key: &str,
) -> &'a watch::Sender<Option<Value>> {
    collections
        .entry(collection.to_string())
        .or_default()
        .entry(key.to_string())
        .or_insert_with(|| watch::channel(None).0)
}

/// Apply one field operation to a document body in place.
fn apply_op(data: &mut Value, key: &str, field: &str, op: &FieldOp) -> Result<(), StoreError> {
    let Some(obj) = data.as_object_mut() else {
        return Err(StoreError::Decode {
            key: key.to_string(),
            message: "document body is not an object".into(),
        });
    };
    let entry = obj
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    // A non-array field is replaced, as the remote store does.
    if !entry.is_array() {
        *entry = Value::Array(Vec::new());
    }
    if let Value::Array(items) = entry {
        match op {
            FieldOp::ArrayUnion(values) => {
                for v in values {
                    if !items.contains(v) {
                        items.push(v.clone());
                    }
                }
            }
            FieldOp::ArrayRemove(values) => items.retain(|item| !values.contains(item)),
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let collections = self.lock();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter_map(|(key, sender)| {
                let data = sender.borrow().clone()?;
                filter.matches(&data).then(|| Document {
                    id: key.clone(),
                    data,
                })
            })
            .collect())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.peek(collection, key).map(|data| Document {
            id: key.to_string(),
            data,
        }))
    }

    async fn subscribe(&self, collection: &str, key: &str) -> Result<SnapshotStream, StoreError> {
        let rx = {
            let mut collections = self.lock();
            slot(&mut collections, collection, key).subscribe()
        };
        let id = key.to_string();
        let stream = WatchStream::new(rx).map(move |data| {
            data.map(|data| Document {
                id: id.clone(),
                data,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn update(
        &self,
        collection: &str,
        key: &str,
        update: DocumentUpdate,
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .fail_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(err);
        }

        let collections = self.lock();
        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        };
        let sender = collections
            .get(collection)
            .and_then(|c| c.get(key))
            .ok_or_else(not_found)?;
        let current = sender.borrow().clone();
        let Some(mut data) = current else {
            return Err(not_found());
        };

        // Work on a copy so a failing operation leaves the document untouched.
        for f in &update.fields {
            apply_op(&mut data, key, &f.field, &f.op)?;
        }
        sender.send_replace(Some(data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpq_core::Timestamp;
    use serde_json::json;

    fn store_with_queue() -> MemoryStore {
        let store = MemoryStore::new();
        store.set("q", "k", json!({ "queue": [], "resolved": [] }));
        store
    }

    #[tokio::test]
    async fn union_is_set_semantics() {
        let store = store_with_queue();
        let item = json!({ "id": "a" });
        for _ in 0..2 {
            let update = DocumentUpdate::new().array_union("queue", &item).unwrap();
            store.update("q", "k", update).await.unwrap();
        }
        assert_eq!(store.peek("q", "k").unwrap()["queue"], json!([{ "id": "a" }]));
        assert_eq!(store.update_calls(), 2);
    }

    #[tokio::test]
    async fn remove_matches_by_value() {
        let store = MemoryStore::new();
        store.set(
            "q",
            "k",
            json!({ "queue": [{ "id": "a", "n": 1 }, { "id": "b" }] }),
        );
        // Same id, different value: nothing removed.
        let update = DocumentUpdate::new()
            .array_remove("queue", &json!({ "id": "a", "n": 2 }))
            .unwrap();
        store.update("q", "k", update).await.unwrap();
        assert_eq!(store.peek("q", "k").unwrap()["queue"].as_array().unwrap().len(), 2);

        let update = DocumentUpdate::new()
            .array_remove("queue", &json!({ "id": "a", "n": 1 }))
            .unwrap();
        store.update("q", "k", update).await.unwrap();
        assert_eq!(store.peek("q", "k").unwrap()["queue"], json!([{ "id": "b" }]));
    }

    #[tokio::test]
    async fn combined_update_touches_both_fields() {
        let store = MemoryStore::new();
        store.set("q", "k", json!({ "queue": [{ "id": "b" }] }));
        let update = DocumentUpdate::new()
            .array_remove("queue", &json!({ "id": "b" }))
            .unwrap()
            .array_union("resolved", &json!({ "id": "b", "points": 10 }))
            .unwrap();
        store.update("q", "k", update).await.unwrap();
        let doc = store.peek("q", "k").unwrap();
        assert_eq!(doc["queue"], json!([]));
        assert_eq!(doc["resolved"], json!([{ "id": "b", "points": 10 }]));
    }

    #[tokio::test]
    async fn update_on_missing_document_fails() {
        let store = MemoryStore::new();
        let update = DocumentUpdate::new().array_union("queue", &json!(1)).unwrap();
        let err = store.update("q", "missing", update).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn injected_failure_leaves_document_alone() {
        let store = store_with_queue();
        store.fail_updates_with(Some(StoreError::PermissionDenied("read-only".into())));
        let update = DocumentUpdate::new().array_union("queue", &json!(1)).unwrap();
        let err = store.update("q", "k", update).await.unwrap_err();
        assert_eq!(err, StoreError::PermissionDenied("read-only".into()));
        assert_eq!(store.peek("q", "k").unwrap()["queue"], json!([]));
    }

    #[tokio::test]
    async fn query_filters_and_counts() {
        let store = MemoryStore::new();
        store.set("c", "old", json!({ "end": "2024-01-01T00:00:00Z" }));
        store.set("c", "new", json!({ "end": "2024-06-01T00:00:00Z" }));
        let cutoff = Timestamp::parse_rfc3339("2024-03-01T00:00:00Z").unwrap();
        let docs = store
            .query("c", &Filter::timestamp_at_least("end", cutoff))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "new");
        assert_eq!(store.query_calls(), 1);

        let none = store
            .query("nothing", &Filter::timestamp_at_least("end", cutoff))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn subscription_sees_current_then_later_writes() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("q", "k").await.unwrap();
        assert_eq!(stream.next().await, Some(None));

        store.set("q", "k", json!({ "queue": [] }));
        let doc = stream.next().await.unwrap().unwrap();
        assert_eq!(doc.id, "k");

        store.delete("q", "k");
        assert_eq!(stream.next().await, Some(None));
    }

    #[test]
    fn seed_must_be_nested_objects() {
        assert!(MemoryStore::from_seed(&json!([1, 2])).is_err());
        assert!(MemoryStore::from_seed(&json!({ "c": 3 })).is_err());
        let store = MemoryStore::from_seed(&json!({ "c": { "k": { "a": 1 } } })).unwrap();
        assert_eq!(store.peek("c", "k"), Some(json!({ "a": 1 })));
    }
}
