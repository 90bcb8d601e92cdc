use std::sync::{Arc, Mutex, PoisonError};

use helpq_core::{ClassroomQueue, Clock, QueueItem, SessionState, StudentStatus};
use helpq_store::{DocumentStore, StoreError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ConfigError, HelpQueueConfig};
use crate::listeners::Subscription;
use crate::mirror::RemoteMirror;
use crate::mutator::QueueMutator;
use crate::tracker::{SessionEvent, SessionTracker};

/// The session/queue synchronization service.
///
/// Cheap to clone; clones share one tracker, one mirror and one set of
/// background tasks.
#[derive(Clone)]
pub struct HelpQueueService {
    tracker: SessionTracker,
    mirror: RemoteMirror,
    mutator: QueueMutator,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HelpQueueService {
    /// Validate `config` and spawn the tracker and mirror tasks on the
    /// current tokio runtime.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: HelpQueueConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let tracker = SessionTracker::new(clock.clone(), cancel.clone());
        let mirror = RemoteMirror::new(tracker.clone());
        let mutator = QueueMutator::new(
            tracker.clone(),
            mirror.clone(),
            store.clone(),
            config.queue_collection.clone(),
            clock,
        );

        let tracker_task = tokio::spawn(tracker.clone().run(
            store.clone(),
            config.session_collection.clone(),
            config.tick_interval(),
        ));
        let mirror_task =
            tokio::spawn(mirror.clone().run(store, config.queue_collection, cancel.clone()));

        Ok(Self {
            tracker,
            mirror,
            mutator,
            cancel,
            tasks: Arc::new(Mutex::new(vec![tracker_task, mirror_task])),
        })
    }

    /// Stop background tasks and wait for them. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
    }

    // ── Session ──

    pub async fn await_ready(&self) {
        self.tracker.await_ready().await;
    }

    pub fn session_state(&self) -> SessionState {
        self.tracker.state()
    }

    pub fn is_live(&self) -> bool {
        self.tracker.is_live()
    }

    /// See [`SessionTracker::on_session_changed`]; must be called within a
    /// tokio runtime context.
    pub fn on_session_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.tracker.on_session_changed(callback)
    }

    // ── Queue ──

    pub async fn on_queue_changed<F>(&self, callback: F) -> Option<Subscription>
    where
        F: Fn(Option<&ClassroomQueue>) + Send + Sync + 'static,
    {
        self.mirror.on_queue_changed(callback).await
    }

    pub fn current_queue(&self) -> Option<ClassroomQueue> {
        self.mirror.current()
    }

    pub fn student_status(&self, student_id: &str, is_ta: bool) -> StudentStatus {
        StudentStatus::from_queue(student_id, self.mirror.current().as_ref(), is_ta)
    }

    pub async fn enqueue(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.mutator.enqueue(item).await
    }

    pub async fn dequeue(&self, id: &str) -> Result<(), StoreError> {
        self.mutator.dequeue(id).await
    }

    pub async fn dequeue_and_enqueue_resolved(&self, points: i64) -> Result<(), StoreError> {
        self.mutator.dequeue_and_enqueue_resolved(points).await
    }

    pub async fn enqueue_resolve(&self, id: &str, points: i64) -> Result<(), StoreError> {
        self.mutator.enqueue_resolve(id, points).await
    }
}
