//! Work signaling between the local store and the scheduler.
//!
//! The scheduler sleeps in [`WorkContext::wait_for_work`] until either
//! the store signals a write ([`WorkContext::notify_about_work`], a
//! data-driven wake) or the timeout expires (an idle wake). The two are
//! distinguished by the return value, which drives the back-off policy:
//! only data-driven cycles skip unhealthy destinations.
//!
//! The counter is a `tokio::sync::watch` channel so a notification that
//! lands between a check and a wait is never lost — the receiver sees
//! the changed value on its next `changed()` call.

use std::time::Duration;
use tokio::sync::watch;

/// Work counter and shutdown signal shared by the store and scheduler.
pub struct WorkContext {
    counter_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for WorkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkContext {
    /// Create a fresh context with no pending work.
    pub fn new() -> Self {
        let (counter_tx, _) = watch::channel(0u64);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            counter_tx,
            shutdown_tx,
        }
    }

    /// Signal that new local writes are waiting.
    ///
    /// Called by the store on client writes and by the scheduler when a
    /// worker reports progress (drain mode).
    pub fn notify_about_work(&self) {
        self.counter_tx.send_modify(|c| *c += 1);
    }

    /// Subscribe to work notifications.
    ///
    /// The scheduler holds one receiver for its whole life so no
    /// notification between cycles is missed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.counter_tx.subscribe()
    }

    /// Block until work is signaled (returns `true`) or `timeout`
    /// expires (returns `false`). Shutdown also returns `false`.
    pub async fn wait_for_work(
        &self,
        timeout: Duration,
        work_rx: &mut watch::Receiver<u64>,
        name: &str,
    ) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }

        tokio::select! {
            changed = work_rx.changed() => {
                tracing::trace!(name, "woken by work notification");
                changed.is_ok()
            }
            _ = shutdown_rx.changed() => false,
            _ = tokio::time::sleep(timeout) => {
                tracing::trace!(name, timeout_ms = timeout.as_millis() as u64, "idle wake");
                false
            }
        }
    }

    /// Whether the engine should keep looping.
    pub fn should_continue(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Request shutdown. Idempotent.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
