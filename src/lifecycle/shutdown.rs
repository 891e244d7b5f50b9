//! Server-wide stop signal.
//!
//! Accept loops stop on it and connection tasks switch hyper into graceful
//! shutdown, so in-flight requests still get their response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// One-shot stop signal shared by every task of a server.
///
/// A task that subscribes after the signal fired misses the broadcast, so it
/// checks [`Shutdown::is_triggered`] first.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    /// Signal that has not fired.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receive the signal when it fires.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Fire the signal. Later calls have no further effect.
    pub fn trigger(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            // No receivers is fine: nothing is running yet.
            let _ = self.tx.send(());
        }
    }

    /// Whether `trigger` was called.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
