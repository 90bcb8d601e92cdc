use std::path::Path;
use std::sync::Arc;

use helpq_core::{ClassroomQueue, SessionWindow};
use helpq_sync::HelpQueueConfig;
use serde::Serialize;
use tokio::time::{timeout, Duration};

use crate::workspace::{clock_at, Workspace};

#[derive(Serialize)]
struct StatusReport {
    session_id: Option<String>,
    window: Option<SessionWindow>,
    is_live: bool,
    queue: Option<ClassroomQueue>,
}

pub async fn execute(seed: &Path, config: HelpQueueConfig, now: Option<String>) -> anyhow::Result<()> {
    let clock = clock_at(now.as_deref())?;
    let ws = Workspace::open(seed, config, Arc::new(clock))?;
    ws.service.await_ready().await;

    let state = ws.service.session_state();
    let queue = if state.session().is_some() {
        first_queue_snapshot(&ws).await?
    } else {
        None
    };
    let report = StatusReport {
        session_id: state.session_id().map(str::to_string),
        window: state.window().copied(),
        is_live: ws.service.is_live(),
        queue,
    };
    ws.service.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn first_queue_snapshot(ws: &Workspace) -> anyhow::Result<Option<ClassroomQueue>> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sub = ws
        .service
        .on_queue_changed(move |q: Option<&ClassroomQueue>| {
            let _ = tx.send(q.cloned());
        })
        .await;
    let Some(sub) = sub else {
        return Ok(None);
    };
    let first = timeout(Duration::from_secs(5), rx.recv()).await;
    sub.unsubscribe();
    match first {
        Ok(Some(queue)) => Ok(queue),
        Ok(None) => Ok(None),
        Err(_) => anyhow::bail!("timed out waiting for the queue document"),
    }
}
