//! Programmatic shutdown trigger.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::watch;

use crate::lifecycle::signals::{ShutdownSignal, SignalSource};

/// A signal source fired from code: tests, control planes, admin handlers.
///
/// Clones share one trigger. Triggering latches: waiters that arrive late
/// still see it, and triggering again changes nothing.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown trigger.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request termination. Returns `true` only for the call that fired it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| !std::mem::replace(triggered, true))
    }

    /// Whether termination has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for Shutdown {
    fn await_termination(&self) -> BoxFuture<'_, ShutdownSignal> {
        let mut rx = self.tx.subscribe();
        Box::pin(async move {
            // The sender lives in `self`, which outlives this future.
            let _ = rx.wait_for(|triggered| *triggered).await;
            ShutdownSignal
        })
    }
}
