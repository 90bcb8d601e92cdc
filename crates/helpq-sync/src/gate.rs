use tokio::sync::watch;

/// One-shot barrier. Opens once; every waiter, past or future, then resolves.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    /// Open the gate. Returns `true` only for the call that opened it.
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspend until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}
