use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Item id format: any string unique within one queue document.
pub type ItemId = String;

/// Session id: the key of the session window document.
pub type SessionId = String;

// ── Timestamp ──

/// A point in time, serialized as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// `None` when `secs` is outside the representable range.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        OffsetDateTime::from_unix_timestamp(secs).ok().map(Self)
    }

    pub fn parse_rfc3339(s: &str) -> Result<Self, time::error::Parse> {
        OffsetDateTime::parse(s, &Rfc3339).map(Self)
    }

    pub fn unix_millis(&self) -> i128 {
        self.0.unix_timestamp_nanos() / 1_000_000
    }

    pub fn as_offset_date_time(&self) -> OffsetDateTime {
        self.0
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self(value)
    }
}

impl Add<time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: time::Duration) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<time::Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: time::Duration) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.format(&Rfc3339) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{}", self.0),
        }
    }
}

// ── Session window ──

/// The stored body of a session document: a half-open `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl SessionWindow {
    pub fn contains(&self, now: Timestamp) -> bool {
        self.start <= now && now < self.end
    }
}

/// One scheduled teaching window, identified by its document key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSession {
    pub id: SessionId,
    pub window: SessionWindow,
}

// ── Queue documents ──

/// One pending help request.
///
/// Equality is full-value equality, payload included. The remote store's
/// set operations match items the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    #[serde(rename = "studentId")]
    pub student_id: String,
    #[serde(rename = "appliedAt")]
    pub applied_at: Timestamp,
    /// Request fields this core does not interpret.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl QueueItem {
    pub fn new(id: impl Into<ItemId>, student_id: impl Into<String>, applied_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            student_id: student_id.into(),
            applied_at,
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Append-only record that a queue item was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedItem {
    pub id: ItemId,
    pub points: i64,
    #[serde(rename = "resolvedAt")]
    pub resolved_at: Timestamp,
}

/// The queue document of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassroomQueue {
    #[serde(default)]
    pub queue: Vec<QueueItem>,
    #[serde(default)]
    pub resolved: Vec<ResolvedItem>,
}

impl ClassroomQueue {
    /// Stable sort by `applied_at`. Equal timestamps keep their document order.
    pub fn sort_by_applied_at(&mut self) {
        self.queue.sort_by_key(|item| item.applied_at);
    }

    pub fn sorted(mut self) -> Self {
        self.sort_by_applied_at();
        self
    }

    pub fn head(&self) -> Option<&QueueItem> {
        self.queue.first()
    }

    pub fn find(&self, id: &str) -> Option<&QueueItem> {
        self.queue.iter().find(|item| item.id == id)
    }

    pub fn waiting(&self) -> usize {
        self.queue.len()
    }

    /// 1-based position of the student's first pending request.
    pub fn position_of(&self, student_id: &str) -> Option<usize> {
        self.queue
            .iter()
            .position(|item| item.student_id == student_id)
            .map(|i| i + 1)
    }

    pub fn is_resolved(&self, id: &str) -> bool {
        self.resolved.iter().any(|r| r.id == id)
    }
}
