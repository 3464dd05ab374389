use async_trait::async_trait;
use chainsync_common::{
    models::{blockchain::Block, error::DataSourceError, Height},
    storage::StorageError,
};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub mod events;
pub mod listener;
pub mod retriever;
pub mod signal;
pub mod supervisor;

pub use events::{BlockEventHandler, BlockEvents, SubscriptionId};
pub use listener::ReconciliationListener;
pub use retriever::{BlockRetriever, RetrievalTask, RetrieverConfig, TaskOutcome};
pub use supervisor::{ChannelFaultHandler, FaultHandler, LoggingFaultHandler, Synchronizer};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A caller handed in something that can never be applied, e.g. a first block that is not
    /// the genesis block.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Already started")]
    AlreadyStarted,
    #[error("Not running")]
    NotRunning,
    #[error("Used after dispose")]
    Disposed,
    #[error("Data source error: {0}")]
    DataSource(#[from] DataSourceError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Retrieval task panicked: {0}")]
    TaskPanicked(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Receives the candidate blocks the retriever fetched and decides how the local chain moves.
///
/// The retriever calls these strictly sequentially, never concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockListener: Send + Sync {
    /// The first height the retriever should request.
    async fn get_start_height(&self) -> SyncResult<Height>;

    /// Applies `block`, a candidate for `height`, and returns the height to request next.
    ///
    /// Returning a height lower than `height` rewinds the retriever.
    async fn process_block(&self, block: &Block, height: Height) -> SyncResult<Height>;

    /// Removes local blocks from the tip down to and including `target_height`.
    async fn discard_blocks(&self, target_height: Height) -> SyncResult<()>;
}
