use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chainsync_common::{
    models::{
        blockchain::{Block, ChainTip, Transaction},
        BlockHash, Height, TxHash,
    },
    storage::StorageError,
    traits::ChainRepository,
};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

#[derive(Debug, Default)]
struct ChainState {
    /// Canonical chain, index == height.
    blocks: Vec<Block>,
    heights: HashMap<BlockHash, Height>,
    /// Transaction hash to (block height, index inside the block).
    transactions: HashMap<TxHash, (Height, usize)>,
}

impl ChainState {
    fn tip(&self) -> Option<ChainTip> {
        self.blocks
            .last()
            .map(|block| ChainTip::new(block.clone(), (self.blocks.len() - 1) as Height))
    }
}

/// An in-memory [`ChainRepository`].
///
/// Cheap to clone, all clones share the same chain.
#[derive(Debug, Clone, Default)]
pub struct MemoryChainRepository {
    state: Arc<RwLock<ChainState>>,
}

impl MemoryChainRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks, i.e. the height the next block will be appended at.
    pub async fn len(&self) -> usize {
        self.state.read().await.blocks.len()
    }

    /// Height of the local tip, `None` while nothing is stored.
    pub async fn height(&self) -> Option<Height> {
        self.state
            .read()
            .await
            .tip()
            .map(|tip| tip.height)
    }

    pub async fn is_empty(&self) -> bool {
        self.state
            .read()
            .await
            .blocks
            .is_empty()
    }

    pub async fn get_block(&self, height: Height) -> Option<Block> {
        self.state
            .read()
            .await
            .blocks
            .get(height as usize)
            .cloned()
    }

    pub async fn get_block_by_hash(&self, hash: &BlockHash) -> Option<(Block, Height)> {
        let state = self.state.read().await;
        let height = *state.heights.get(hash)?;
        state
            .blocks
            .get(height as usize)
            .map(|block| (block.clone(), height))
    }

    /// Looks up a transaction of the canonical chain together with the height of its block.
    pub async fn get_transaction(&self, hash: &TxHash) -> Option<(Transaction, Height)> {
        let state = self.state.read().await;
        let (height, index) = *state.transactions.get(hash)?;
        state
            .blocks
            .get(height as usize)
            .and_then(|block| block.transactions.get(index))
            .map(|tx| (tx.clone(), height))
    }

    /// Returns all stored block hashes ordered by height.
    pub async fn hashes(&self) -> Vec<BlockHash> {
        self.state
            .read()
            .await
            .blocks
            .iter()
            .map(|block| block.hash.clone())
            .collect()
    }
}

#[async_trait]
impl ChainRepository for MemoryChainRepository {
    async fn get_tip(&self) -> Result<Option<ChainTip>, StorageError> {
        Ok(self.state.read().await.tip())
    }

    #[instrument(skip_all, fields(height = height, hash = %block.hash))]
    async fn append(&self, block: &Block, height: Height) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let expected = state.blocks.len() as Height;
        if height != expected {
            return Err(StorageError::InvalidArgument(format!(
                "cannot append block {} at height {height}, next height is {expected}",
                block.hash
            )));
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            state
                .transactions
                .insert(tx.hash.clone(), (height, index));
        }
        state
            .heights
            .insert(block.hash.clone(), height);
        state.blocks.push(block.clone());
        trace!(txs = block.transactions.len(), "Block appended");
        Ok(())
    }

    #[instrument(skip_all)]
    async fn remove_tip(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let block = state
            .blocks
            .pop()
            .ok_or_else(|| {
                StorageError::InvalidArgument("cannot remove the tip of an empty chain".to_string())
            })?;

        for tx in block.transactions.iter() {
            state.transactions.remove(&tx.hash);
        }
        state.heights.remove(&block.hash);
        debug!(hash = %block.hash, height = state.blocks.len(), "Tip removed");
        Ok(())
    }
}
