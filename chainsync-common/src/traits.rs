use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::{
    models::{
        blockchain::{Block, ChainSummary, ChainTip},
        error::{DataSourceError, NotificationError},
        BlockHash, Height,
    },
    storage::StorageError,
};

/// Point-in-time queries against the remote node.
///
/// Implementations own their retry and backoff policy: an `Err` returned from here is treated as
/// a fault by the synchronizer and is not retried.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Returns the block the remote node considers canonical at `height`, or `None` if the node
    /// has not produced that height (yet).
    async fn get_block_by_height(&self, height: Height) -> Result<Option<Block>, DataSourceError>;

    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, DataSourceError>;

    /// Returns the remote tip height together with some metadata about the remote chain.
    async fn get_chain_summary(&self) -> Result<ChainSummary, DataSourceError>;
}

/// A subscribe-only channel signalling that the remote node extended its chain.
///
/// Delivery is best effort. Consumers may only use it to shorten polling delays, never for
/// correctness.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Subscribe to `topic`. The receiver yields the hash of every new remote block the channel
    /// learns about; it closes when the channel shuts down.
    async fn subscribe(&self, topic: &str) -> Result<Receiver<BlockHash>, NotificationError>;
}

/// Durable store of the local chain.
///
/// Each operation must be atomic: the synchronizer's gap-free guarantee relies on a tip read,
/// a tip append and a tip removal never being observed half applied.
#[cfg_attr(feature = "test-utils", mockall::automock)]
#[async_trait]
pub trait ChainRepository: Send + Sync {
    /// Returns the locally stored tip, or `None` if nothing is stored.
    async fn get_tip(&self) -> Result<Option<ChainTip>, StorageError>;

    /// Appends `block` at `height`. The caller is responsible for having validated ancestry.
    async fn append(&self, block: &Block, height: Height) -> Result<(), StorageError>;

    /// Removes the current tip. Calling this on an empty repository is a caller error.
    async fn remove_tip(&self) -> Result<(), StorageError>;
}
