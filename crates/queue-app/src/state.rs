//! Per-consumer lifecycle state and in-flight accounting.
//!
//! Every consumer owns one [`ConsumerState`]. The pipeline and the receive
//! loop of that consumer are the only writers; the orchestrator reads it to
//! decide when shutdown may release resources.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;

// ============================================================================
// InFlightCounter
// ============================================================================

/// Counter that signals waiters whenever it drops to zero
#[derive(Debug, Default)]
pub struct InFlightCounter {
    count: AtomicUsize,
    zero: Notify,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        let previous = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight counter underflow");
        if previous == 1 {
            self.zero.notify_waiters();
        }
    }

    /// Wait until the counter reads zero
    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Holds one unit of in-flight work; releases it on drop
///
/// Dropping happens on every exit path, panics and early returns included,
/// so each increment has exactly one matching decrement.
#[derive(Debug)]
pub struct InFlightGuard {
    state: Arc<ConsumerState>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.in_flight.decrement();
    }
}

// ============================================================================
// ConsumerState
// ============================================================================

/// Shutdown flags, in-flight counter and cancel handle of one consumer
#[derive(Debug, Default)]
pub struct ConsumerState {
    shutting_down: AtomicBool,
    polling_active: AtomicBool,
    receiving: AtomicBool,
    receive_stopped: Notify,
    in_flight: InFlightCounter,
    cancel: CancellationToken,
}

impl ConsumerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new work, stop polling and cancel blocked fetches.
    ///
    /// One-way: the state never leaves shutdown once entered.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.polling_active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_polling_active(&self) -> bool {
        self.polling_active.load(Ordering::SeqCst)
    }

    pub fn set_polling_active(&self, active: bool) {
        self.polling_active.store(active, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Admit one message for processing.
    ///
    /// The counter is raised before the shutdown flag is read, so a stop
    /// that has already observed zero in-flight can never be followed by a
    /// successful admission. Returns `None` once shutdown has begun.
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.increment();
        let guard = InFlightGuard {
            state: Arc::clone(self),
        };

        if self.is_shutting_down() {
            drop(guard);
            return None;
        }
        Some(guard)
    }

    /// Count work that must finish before shutdown releases resources,
    /// regardless of the shutdown flag. Used for releasing rejected messages.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.increment();
        InFlightGuard {
            state: Arc::clone(self),
        }
    }

    /// Wait until every admitted message has finished
    pub async fn wait_drained(&self) {
        self.in_flight.wait_for_zero().await;
    }

    /// Mark the receive loop as running; it stays marked until the returned
    /// guard drops.
    pub(crate) fn start_receiving(self: &Arc<Self>) -> ReceiveGuard {
        self.receiving.store(true, Ordering::SeqCst);
        ReceiveGuard {
            state: Arc::clone(self),
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Wait until the receive loop has exited (immediately if it never ran)
    pub async fn wait_receive_stopped(&self) {
        loop {
            let notified = self.receive_stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_receiving() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a receive loop as running for as long as it is held
#[derive(Debug)]
pub(crate) struct ReceiveGuard {
    state: Arc<ConsumerState>,
}

impl Drop for ReceiveGuard {
    fn drop(&mut self) {
        self.state.receiving.store(false, Ordering::SeqCst);
        self.state.receive_stopped.notify_waiters();
    }
}
