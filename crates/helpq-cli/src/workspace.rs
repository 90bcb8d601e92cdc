use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use helpq_core::{Clock, ManualClock, Timestamp};
use helpq_store::{DocumentStore, MemoryStore};
use helpq_sync::{HelpQueueConfig, HelpQueueService};

/// A running service over an in-memory store seeded from a file.
pub struct Workspace {
    pub store: Arc<MemoryStore>,
    pub service: HelpQueueService,
}

impl Workspace {
    pub fn open(seed: &Path, config: HelpQueueConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let store = Arc::new(load_seed(seed)?);
        let dyn_store: Arc<dyn DocumentStore> = store.clone();
        let service = HelpQueueService::start(dyn_store, clock, config)?;
        Ok(Self { store, service })
    }
}

pub fn load_seed(path: &Path) -> anyhow::Result<MemoryStore> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read seed file {}", path.display()))?;
    let seed: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("seed file {} is not valid JSON", path.display()))?;
    Ok(MemoryStore::from_seed(&seed)?)
}

/// `--now` as a manual clock, or the wall clock's current instant.
pub fn clock_at(now: Option<&str>) -> anyhow::Result<ManualClock> {
    let at = match now {
        Some(s) => Timestamp::parse_rfc3339(s).with_context(|| format!("invalid --now: {s}"))?,
        None => Timestamp::now(),
    };
    Ok(ManualClock::new(at))
}
