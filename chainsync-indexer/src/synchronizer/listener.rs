use std::sync::Arc;

use async_trait::async_trait;
use chainsync_common::{
    models::{
        blockchain::{Block, BlockEvent, ChainTip},
        BlockHash, Height,
    },
    traits::ChainRepository,
};
use metrics::{counter, gauge};
use tracing::{debug, info, instrument, warn};

use super::{events::BlockEvents, BlockListener, SyncError, SyncResult};

/// Reconciles candidate blocks with the local chain.
///
/// This is the only place the local chain is mutated: blocks are appended strictly in height
/// order and only ever removed from the tip.
pub struct ReconciliationListener {
    repository: Arc<dyn ChainRepository>,
    genesis_hash: BlockHash,
    events: Arc<BlockEvents>,
}

impl ReconciliationListener {
    pub fn new(
        repository: Arc<dyn ChainRepository>,
        genesis_hash: BlockHash,
        events: Arc<BlockEvents>,
    ) -> Self {
        Self { repository, genesis_hash, events }
    }

    async fn append(&self, block: &Block, height: Height) -> SyncResult<()> {
        self.repository
            .append(block, height)
            .await?;
        counter!("chainsync_blocks_added_total").increment(1);
        gauge!("chainsync_local_height").set(height as f64);
        debug!(height, hash = %block.hash, "Block added");
        self.events
            .emit_added(&BlockEvent::new(block.clone(), height));
        Ok(())
    }

    /// Announces the removal of `tip` and then removes it.
    async fn remove_tip(&self, tip: ChainTip) -> SyncResult<()> {
        let event = BlockEvent::from(tip);
        self.events.emit_removing(&event);
        self.repository.remove_tip().await?;
        counter!("chainsync_blocks_removed_total").increment(1);
        gauge!("chainsync_local_height").set(event.height.saturating_sub(1) as f64);
        debug!(%event, "Block removed");
        Ok(())
    }
}

#[async_trait]
impl BlockListener for ReconciliationListener {
    async fn get_start_height(&self) -> SyncResult<Height> {
        Ok(self
            .repository
            .get_tip()
            .await?
            .map_or(0, |tip| tip.next_height()))
    }

    #[instrument(skip_all, fields(height = height, hash = %block.hash))]
    async fn process_block(&self, block: &Block, height: Height) -> SyncResult<Height> {
        let Some(tip) = self.repository.get_tip().await? else {
            if height != 0 {
                return Err(SyncError::InvalidArgument(format!(
                    "first stored block must be at height 0, got {height}"
                )));
            }
            if block.hash != self.genesis_hash {
                return Err(SyncError::InvalidArgument(format!(
                    "block {} is not the genesis block {}",
                    block.hash, self.genesis_hash
                )));
            }
            info!("Storing genesis block");
            self.append(block, 0).await?;
            return Ok(1);
        };

        let next = tip.next_height();
        if height != next {
            // Stale or ahead of us, the retriever has to ask again for `next`.
            debug!(next, "Ignoring candidate at unexpected height");
            return Ok(next);
        }

        if !block.extends(&tip.block) {
            warn!(
                tip_height = tip.height,
                tip_hash = %tip.block.hash,
                parent_hash = %block.parent_hash,
                "Candidate does not extend local tip, removing tip"
            );
            counter!("chainsync_reorgs_total").increment(1);
            let tip_height = tip.height;
            self.remove_tip(tip).await?;
            return Ok(tip_height);
        }

        self.append(block, height).await?;
        Ok(height + 1)
    }

    #[instrument(skip(self))]
    async fn discard_blocks(&self, target_height: Height) -> SyncResult<()> {
        let mut discarded = 0usize;
        while let Some(tip) = self.repository.get_tip().await? {
            if tip.height < target_height {
                break;
            }
            self.remove_tip(tip).await?;
            discarded += 1;
        }
        if discarded > 0 {
            info!(discarded, "Discarded local blocks");
        }
        Ok(())
    }
}
