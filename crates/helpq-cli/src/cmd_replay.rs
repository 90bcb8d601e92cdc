use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use helpq_core::{ClassroomQueue, Clock, QueueItem, Timestamp};
use helpq_sync::HelpQueueConfig;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::workspace::{clock_at, Workspace};

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One scripted queue operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    Enqueue {
        student_id: String,
        #[serde(default)]
        id: Option<String>,
        /// Defaults to the replay clock.
        #[serde(default)]
        applied_at: Option<Timestamp>,
        #[serde(default)]
        payload: serde_json::Map<String, serde_json::Value>,
    },
    Dequeue {
        id: String,
    },
    ResolveHead {
        points: i64,
    },
    Resolve {
        id: String,
        points: i64,
    },
    /// Move the replay clock forward.
    Advance {
        secs: i64,
    },
}

fn load_ops(path: &Path) -> anyhow::Result<Vec<Op>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read ops file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid ops file {}", path.display()))
}

pub async fn execute(
    seed: &Path,
    ops: &Path,
    config: HelpQueueConfig,
    now: Option<String>,
) -> anyhow::Result<()> {
    let ops = load_ops(ops)?;
    let clock = clock_at(now.as_deref())?;
    let queue_collection = config.queue_collection.clone();
    let ws = Workspace::open(seed, config, Arc::new(clock.clone()))?;
    ws.service.await_ready().await;

    let Some(session_id) = ws.service.session_state().session_id().map(str::to_string) else {
        ws.service.shutdown().await;
        anyhow::bail!("no class session has started; nothing to replay against");
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = ws
        .service
        .on_queue_changed(move |q: Option<&ClassroomQueue>| {
            let _ = tx.send(q.cloned());
        })
        .await
        .context("session vanished before the queue subscription")?;
    wait_for_push(&mut rx).await?;

    for (step, op) in ops.into_iter().enumerate() {
        debug!(step, ?op, "replaying");
        let before = ws.store.update_calls();
        match op {
            Op::Enqueue {
                student_id,
                id,
                applied_at,
                payload,
            } => {
                let id = id.unwrap_or_else(|| ulid::Ulid::new().to_string());
                let mut item =
                    QueueItem::new(id, student_id, applied_at.unwrap_or_else(|| clock.now()));
                item.payload = payload;
                ws.service.enqueue(&item).await?;
            }
            Op::Dequeue { id } => ws.service.dequeue(&id).await?,
            Op::ResolveHead { points } => ws.service.dequeue_and_enqueue_resolved(points).await?,
            Op::Resolve { id, points } => ws.service.enqueue_resolve(&id, points).await?,
            Op::Advance { secs } => {
                clock.advance(time::Duration::seconds(secs));
                continue;
            }
        }
        if ws.store.update_calls() > before {
            wait_for_push(&mut rx).await?;
        } else {
            info!(step, "operation made no remote change");
        }
    }
    sub.unsubscribe();
    ws.service.shutdown().await;

    let doc = ws
        .store
        .peek(&queue_collection, &session_id)
        .unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn wait_for_push(
    rx: &mut mpsc::UnboundedReceiver<Option<ClassroomQueue>>,
) -> anyhow::Result<Option<ClassroomQueue>> {
    match timeout(PUSH_TIMEOUT, rx.recv()).await {
        Ok(Some(queue)) => Ok(queue),
        Ok(None) => anyhow::bail!("queue listener dropped"),
        Err(_) => {
            warn!("no queue push within {PUSH_TIMEOUT:?}");
            anyhow::bail!("timed out waiting for the queue document")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_parse_from_tagged_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(
            &path,
            r#"[
                { "op": "enqueue", "student_id": "st-1", "payload": { "topic": "lab 2" } },
                { "op": "enqueue", "student_id": "st-2", "id": "x", "applied_at": "2024-03-01T09:05:00Z" },
                { "op": "advance", "secs": 60 },
                { "op": "resolve_head", "points": 10 },
                { "op": "resolve", "id": "x", "points": 3 },
                { "op": "dequeue", "id": "x" }
            ]"#,
        )
        .unwrap();
        let ops = load_ops(&path).unwrap();
        assert_eq!(ops.len(), 6);
        match &ops[0] {
            Op::Enqueue { id, payload, .. } => {
                assert!(id.is_none());
                assert_eq!(payload["topic"], "lab 2");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            ops[1],
            Op::Enqueue {
                student_id: "st-2".into(),
                id: Some("x".into()),
                applied_at: Some(Timestamp::parse_rfc3339("2024-03-01T09:05:00Z").unwrap()),
                payload: serde_json::Map::new(),
            }
        );
        assert_eq!(ops[3], Op::ResolveHead { points: 10 });
    }

    #[test]
    fn unknown_op_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(&path, r#"[{ "op": "teleport" }]"#).unwrap();
        let err = load_ops(&path).unwrap_err();
        assert!(err.to_string().contains("invalid ops file"));
    }
}
