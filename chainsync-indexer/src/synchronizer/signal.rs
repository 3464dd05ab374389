//! Single slot wake up primitive between the retrieval loop and notification sources.
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use super::{SyncError, SyncResult};

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Waiting(oneshot::Sender<()>),
    Disposed,
}

/// Wakes at most one registered waiter.
///
/// A release without a registered waiter is dropped rather than stored, so a waiter only ever
/// observes releases that happened after it registered. Registering replaces a previous waiter,
/// whose receiver then resolves with an error.
#[derive(Debug, Default)]
pub struct NewBlockSignal {
    slot: Mutex<Slot>,
}

impl NewBlockSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        // The slot is a plain value, a panic while holding the lock can't leave it torn.
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the caller as the waiter. The returned receiver resolves on the next release.
    pub fn register(&self) -> SyncResult<oneshot::Receiver<()>> {
        let mut slot = self.slot();
        if matches!(*slot, Slot::Disposed) {
            return Err(SyncError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Slot::Waiting(tx);
        Ok(rx)
    }

    /// Wakes the registered waiter. Returns whether there was one.
    ///
    /// Never fails, releasing a disposed signal is a no-op.
    pub fn release(&self) -> bool {
        let mut slot = self.slot();
        match std::mem::take(&mut *slot) {
            Slot::Waiting(tx) => {
                // The waiter may have given up already, that's fine.
                let woken = tx.send(()).is_ok();
                trace!(woken, "Released new block signal");
                woken
            }
            Slot::Empty => false,
            Slot::Disposed => {
                *slot = Slot::Disposed;
                false
            }
        }
    }

    /// Disposes the signal. A pending waiter is woken, later registrations fail.
    pub fn dispose(&self) {
        let mut slot = self.slot();
        if let Slot::Waiting(tx) = std::mem::replace(&mut *slot, Slot::Disposed) {
            let _ = tx.send(());
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.slot(), Slot::Disposed)
    }
}
