use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chainsync_common::models::blockchain::BlockEvent;
use tracing::trace;

pub type BlockEventHandler = Arc<dyn Fn(&BlockEvent) + Send + Sync>;

/// Identifies a registered handler, used to unsubscribe it again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Handlers = Vec<(SubscriptionId, BlockEventHandler)>;

/// Block added and block removing notifications for downstream consumers.
///
/// Handlers run synchronously on the retrieval loop, in registration order. A handler that
/// panics takes the loop down with it.
#[derive(Default)]
pub struct BlockEvents {
    added: Mutex<Handlers>,
    removing: Mutex<Handlers>,
    next_id: AtomicU64,
}

fn lock(handlers: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
    handlers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

impl BlockEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, handlers: &Mutex<Handlers>, handler: BlockEventHandler) -> SubscriptionId {
        let id = SubscriptionId(
            self.next_id
                .fetch_add(1, Ordering::Relaxed),
        );
        lock(handlers).push((id, handler));
        id
    }

    /// Registers a handler invoked after a block was appended to local storage.
    pub fn on_block_added<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.register(&self.added, Arc::new(handler))
    }

    /// Registers a handler invoked right before the local tip is removed.
    pub fn on_block_removing<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.register(&self.removing, Arc::new(handler))
    }

    /// Removes a handler. Returns `false` if it was not registered (anymore).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        [&self.added, &self.removing]
            .into_iter()
            .any(|handlers| {
                let mut handlers = lock(handlers);
                let before = handlers.len();
                handlers.retain(|(handler_id, _)| *handler_id != id);
                handlers.len() != before
            })
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.added).len() + lock(&self.removing).len()
    }

    pub(crate) fn emit_added(&self, event: &BlockEvent) {
        Self::dispatch(&self.added, event, "added");
    }

    pub(crate) fn emit_removing(&self, event: &BlockEvent) {
        Self::dispatch(&self.removing, event, "removing");
    }

    fn dispatch(handlers: &Mutex<Handlers>, event: &BlockEvent, kind: &str) {
        // Snapshot first so handlers may (un)subscribe without deadlocking.
        let snapshot: Vec<BlockEventHandler> = lock(handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        trace!(%event, kind, subscribers = snapshot.len(), "Dispatching block event");
        for handler in snapshot {
            handler(event);
        }
    }
}

impl fmt::Debug for BlockEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockEvents")
            .field("added", &lock(&self.added).len())
            .field("removing", &lock(&self.removing).len())
            .finish()
    }
}
