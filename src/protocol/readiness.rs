//! One-shot readiness barrier.
//!
//! The engine loads asynchronously at process start; no protocol command may
//! touch it before that finishes. The gate transitions `Uninitialized` to
//! `Ready` exactly once and never back. Waiters that arrive after the
//! transition resolve immediately.

use tokio::sync::watch;

/// Owner side of the barrier. Held by whoever completes initialization.
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Mark the engine ready. The transition is irreversible; calling this
    /// again is a no-op.
    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// A handle that can await the transition any number of times.
    pub fn handle(&self) -> ReadyHandle {
        ReadyHandle {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiter side of the barrier.
#[derive(Clone)]
pub struct ReadyHandle {
    rx: watch::Receiver<bool>,
}

impl ReadyHandle {
    /// Resolve once the gate is marked ready. Resolves immediately on every
    /// call after the first completion.
    pub async fn await_ready(&mut self) {
        // The sender outliving the transition is the normal case; a dropped
        // sender after `mark_ready` still observes the final value.
        let _ = self.rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }
}
