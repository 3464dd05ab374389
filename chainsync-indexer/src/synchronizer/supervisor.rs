use std::sync::Arc;

use chainsync_common::{
    models::{blockchain::BlockEvent, BlockHash},
    traits::{ChainDataSource, ChainRepository, NotificationChannel},
};
#[cfg(test)]
use mockall::automock;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

use super::{
    events::{BlockEvents, SubscriptionId},
    listener::ReconciliationListener,
    retriever::{BlockRetriever, RetrieverConfig, TaskOutcome},
    SyncError, SyncResult,
};

/// Receives faults that terminated a synchronization run.
///
/// Decides what a fault means for the process, the synchronizer itself only stops.
#[cfg_attr(test, automock)]
pub trait FaultHandler: Send + Sync {
    fn handle_fault(&self, error: &SyncError);
}

/// Logs faults and carries on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFaultHandler;

impl FaultHandler for LoggingFaultHandler {
    fn handle_fault(&self, error: &SyncError) {
        error!(%error, "Synchronization terminated with a fault");
    }
}

/// Forwards faults to a channel, e.g. to let the main task shut the process down.
#[derive(Debug, Clone)]
pub struct ChannelFaultHandler {
    tx: mpsc::UnboundedSender<SyncError>,
}

impl ChannelFaultHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FaultHandler for ChannelFaultHandler {
    fn handle_fault(&self, error: &SyncError) {
        if self.tx.send(error.clone()).is_err() {
            error!(%error, "Fault receiver gone, dropping fault");
        }
    }
}

enum SupervisorState {
    Idle,
    Running { stop: CancellationToken, handle: JoinHandle<SyncResult<()>> },
    Disposed,
}

/// Keeps the local chain in sync with the remote node in the background.
///
/// Wires a [`BlockRetriever`] to a [`ReconciliationListener`] and exposes block added and
/// block removing events to downstream consumers.
pub struct Synchronizer {
    retriever: Arc<BlockRetriever>,
    repository: Arc<dyn ChainRepository>,
    genesis_hash: BlockHash,
    events: Arc<BlockEvents>,
    fault_handler: Arc<dyn FaultHandler>,
    state: Mutex<SupervisorState>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn ChainDataSource>,
        notifications: Arc<dyn NotificationChannel>,
        repository: Arc<dyn ChainRepository>,
        genesis_hash: BlockHash,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            retriever: Arc::new(BlockRetriever::new(source, notifications, config)),
            repository,
            genesis_hash,
            events: Arc::new(BlockEvents::new()),
            fault_handler: Arc::new(LoggingFaultHandler),
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    pub fn with_fault_handler(mut self, fault_handler: Arc<dyn FaultHandler>) -> Self {
        self.fault_handler = fault_handler;
        self
    }

    pub fn on_block_added<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.events.on_block_added(handler)
    }

    pub fn on_block_removing<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        self.events.on_block_removing(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Starts synchronizing from the local tip onwards.
    ///
    /// A run that ended with a fault may be started again without stopping it first.
    #[instrument(skip_all)]
    pub async fn start(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        match &*state {
            SupervisorState::Idle => {}
            SupervisorState::Running { handle, .. } if handle.is_finished() => {}
            SupervisorState::Running { .. } => return Err(SyncError::AlreadyStarted),
            SupervisorState::Disposed => return Err(SyncError::Disposed),
        }

        let listener = Arc::new(ReconciliationListener::new(
            self.repository.clone(),
            self.genesis_hash.clone(),
            self.events.clone(),
        ));
        let mut task = self.retriever.start(listener).await?;

        let stop = CancellationToken::new();
        let retriever = self.retriever.clone();
        let fault_handler = self.fault_handler.clone();
        let stop_requested = stop.clone();
        let handle = tokio::spawn(
            async move {
                let res = tokio::select! {
                    outcome = task.wait() => match outcome {
                        TaskOutcome::Faulted(err) => Err(err),
                        TaskOutcome::Cancelled => Ok(()),
                    },
                    _ = stop_requested.cancelled() => Ok(()),
                };
                match retriever.stop().await {
                    Ok(()) | Err(SyncError::NotRunning) => {}
                    Err(err) => warn!(error = %err, "Failed to stop block retriever"),
                }
                if let Err(err) = &res {
                    fault_handler.handle_fault(err);
                }
                res
            }
            .instrument(tracing::info_span!("synchronizer")),
        );

        *state = SupervisorState::Running { stop, handle };
        info!(genesis = %self.genesis_hash, "Synchronizer started");
        Ok(())
    }

    /// Stops synchronizing and waits for the background work to finish.
    ///
    /// Faults of the run were already handed to the [`FaultHandler`] and are not returned.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> SyncResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SupervisorState::Idle) {
            SupervisorState::Running { stop, handle } => Self::join(stop, handle).await,
            SupervisorState::Idle => Err(SyncError::NotRunning),
            SupervisorState::Disposed => {
                *state = SupervisorState::Disposed;
                Err(SyncError::Disposed)
            }
        }
    }

    /// Stops a running synchronization and releases the retriever. Calling it again is a no-op.
    #[instrument(skip_all)]
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if let SupervisorState::Running { stop, handle } =
            std::mem::replace(&mut *state, SupervisorState::Disposed)
        {
            if let Err(err) = Self::join(stop, handle).await {
                warn!(error = %err, "Synchronizer did not shut down cleanly");
            }
        }
        self.retriever.dispose().await;
    }

    /// Whether a run is active. A run that ended with a fault is not.
    pub async fn is_running(&self) -> bool {
        matches!(
            &*self.state.lock().await,
            SupervisorState::Running { handle, .. } if !handle.is_finished()
        )
    }

    async fn join(stop: CancellationToken, handle: JoinHandle<SyncResult<()>>) -> SyncResult<()> {
        stop.cancel();
        match handle.await {
            Ok(_) => {
                info!("Synchronizer stopped");
                Ok(())
            }
            Err(err) => Err(SyncError::TaskPanicked(err.to_string())),
        }
    }
}
