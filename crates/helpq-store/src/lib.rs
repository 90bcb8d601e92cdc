//! Contracts for the two external collaborators of the sync core: an
//! authenticated document database and an identity provider.
//!
//! The core only ever talks to these traits. `MemoryStore` and
//! `MemoryIdentityProvider` back the tests and the CLI.

pub mod identity;
pub mod memory;

use std::pin::Pin;

use helpq_core::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_stream::Stream;

pub use identity::{AuthError, Identity, IdentityProvider, MemoryIdentityProvider};
pub use memory::MemoryStore;

// ── Errors ──

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{key}")]
    NotFound { collection: String, key: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("cannot decode document {key}: {message}")]
    Decode { key: String, message: String },
    #[error("cannot encode value: {0}")]
    Encode(String),
}

// ── Documents ──

/// One stored document: its key plus a JSON object body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.data.clone()).map_err(|e| StoreError::Decode {
            key: self.id.clone(),
            message: e.to_string(),
        })
    }
}

/// A full-document snapshot from a push subscription. `None` means the
/// document does not exist (yet or anymore).
pub type Snapshot = Option<Document>;

/// Live stream of snapshots. Ends when the store drops the subscription.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Snapshot> + Send>>;

// ── Queries ──

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field >= value`, where the field holds a timestamp.
    TimestampAtLeast { field: String, value: Timestamp },
}

impl Filter {
    pub fn timestamp_at_least(field: impl Into<String>, value: Timestamp) -> Self {
        Filter::TimestampAtLeast {
            field: field.into(),
            value,
        }
    }

    /// Whether a document body passes. Fields that are missing or not
    /// timestamps never match.
    pub fn matches(&self, data: &serde_json::Value) -> bool {
        match self {
            Filter::TimestampAtLeast { field, value } => data
                .get(field)
                .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok())
                .is_some_and(|t| t >= *value),
        }
    }
}

// ── Conditional updates ──

/// A field-level operation the store applies atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Append each value not already present (set union by value).
    ArrayUnion(Vec<serde_json::Value>),
    /// Remove every element equal to one of the values.
    ArrayRemove(Vec<serde_json::Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub op: FieldOp,
}

/// All field operations of one request. A store applies them together or
/// not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub fields: Vec<FieldUpdate>,
}

impl DocumentUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn array_union<T: Serialize>(self, field: &str, value: &T) -> Result<Self, StoreError> {
        let value = encode(value)?;
        Ok(self.push(field, FieldOp::ArrayUnion(vec![value])))
    }

    pub fn array_remove<T: Serialize>(self, field: &str, value: &T) -> Result<Self, StoreError> {
        let value = encode(value)?;
        Ok(self.push(field, FieldOp::ArrayRemove(vec![value])))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push(mut self, field: &str, op: FieldOp) -> Self {
        self.fields.push(FieldUpdate {
            field: field.to_string(),
            op,
        });
        self
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))
}

// ── Store contract ──

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// All documents in `collection` passing `filter`, in key order.
    async fn query(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    /// Push subscription to one document. The stream yields the current
    /// snapshot first, then one snapshot per later write.
    async fn subscribe(&self, collection: &str, key: &str) -> Result<SnapshotStream, StoreError>;

    /// Apply every field operation of `update` in one atomic write.
    /// Fails with `NotFound` when the document does not exist.
    async fn update(
        &self,
        collection: &str,
        key: &str,
        update: DocumentUpdate,
    ) -> Result<(), StoreError>;
}
