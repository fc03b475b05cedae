use std::sync::Arc;

use tokio::sync::watch;

/// Fleet-wide termination signal: set at most once, never reset for the
/// lifetime of the process. Workers check it at the top of each loop
/// iteration and around multi-second blocking stages.
#[derive(Clone)]
pub struct ShutdownFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        ShutdownFlag {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Requests cooperative termination of every worker. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once termination has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}
