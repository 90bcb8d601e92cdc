use std::path::Path;
use std::sync::Arc;

use helpq_core::{ClassroomQueue, SystemClock};
use helpq_sync::HelpQueueConfig;
use tokio::time::Duration;
use tracing::info;

use crate::workspace::Workspace;

pub async fn execute(seed: &Path, config: HelpQueueConfig, secs: u64) -> anyhow::Result<()> {
    let ws = Workspace::open(seed, config, Arc::new(SystemClock))?;

    let session_sub = ws.service.on_session_changed(|event| {
        info!(
            live = event.is_live,
            start = ?event.window.map(|w| w.start.to_string()),
            end = ?event.window.map(|w| w.end.to_string()),
            "session changed"
        );
    });
    let queue_sub = ws
        .service
        .on_queue_changed(|queue: Option<&ClassroomQueue>| match queue {
            Some(q) => info!(
                waiting = q.waiting(),
                resolved = q.resolved.len(),
                head = ?q.head().map(|i| i.id.as_str()),
                "queue changed"
            ),
            None => info!("queue document missing"),
        })
        .await;
    if queue_sub.is_none() {
        info!("no class session has started; watching session only");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    session_sub.unsubscribe();
    if let Some(sub) = queue_sub {
        sub.unsubscribe();
    }
    ws.service.shutdown().await;
    Ok(())
}
