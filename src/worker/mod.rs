// ============================================================================
// Background Loops
// ============================================================================
//
// Every loop receives a ShutdownSignal at construction and checks it at the
// top of each cycle. Sleeps race against the signal so a stop request lands
// within one poll interval; a cycle already talking to the store finishes.
//
// ============================================================================

pub mod refresh;

pub use refresh::{CacheRefreshWorker, CachedPayload, DataSource, RefreshOutcome};

use std::time::Duration;
use tokio::sync::watch;

/// Sending half of the stop signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable receiving half handed to each loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `duration` unless shutdown arrives first.
    ///
    /// Returns `true` when the sleep was cut short by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            changed = self.rx.changed() => changed.is_err() || self.is_triggered(),
        }
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}
