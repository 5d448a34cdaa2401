//! Cooperative cancellation signal.
//!
//! A single flag, set at most once, observed at every suspend point of the
//! scheduler: loop top, before a network call, during backoff and during the
//! inter-cycle pause.

use std::time::Duration;

use tokio::sync::watch;

/// Create a linked trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

/// Sets the cancellation flag.
#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    /// Set the flag. Further calls are no-ops.
    pub fn trigger(&self) {
        self.0.send_if_modified(|stop| {
            if *stop {
                return false;
            }
            *stop = true;
            true
        });
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

/// Observes the cancellation flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_set(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the flag is set. Never resolves if the trigger is gone
    /// without having fired.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` or until cancelled, whichever comes first.
    ///
    /// Returns true if cancelled.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_set() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.cancelled() => true,
        }
    }
}
