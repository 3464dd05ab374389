use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chainsync_common::{
    models::{error::NotificationError, BlockHash},
    traits::{ChainDataSource, NotificationChannel},
};
use tokio::{
    sync::mpsc::{self, Receiver},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn, Instrument};

/// Topic bitcoind's zmq interface publishes new best block hashes on.
pub const HASHBLOCK_TOPIC: &str = "hashblock";

/// A [`NotificationChannel`] for nodes without a push interface.
///
/// Each subscription spawns a task polling the remote chain summary and emits the best block
/// hash whenever it changes. The task stops as soon as the subscriber drops its receiver.
#[derive(Clone)]
pub struct BestBlockPoller {
    source: Arc<dyn ChainDataSource>,
    poll_interval: Duration,
    buffer_size: usize,
}

impl BestBlockPoller {
    pub fn new(source: Arc<dyn ChainDataSource>, poll_interval: Duration) -> Self {
        Self { source, poll_interval, buffer_size: 16 }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

#[async_trait]
impl NotificationChannel for BestBlockPoller {
    async fn subscribe(&self, topic: &str) -> Result<Receiver<BlockHash>, NotificationError> {
        if topic != HASHBLOCK_TOPIC {
            return Err(NotificationError::SubscribeError(
                topic.to_string(),
                format!("only {HASHBLOCK_TOPIC} is supported"),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(NotificationError::SubscribeError(
                topic.to_string(),
                "poll interval must be non-zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.buffer_size);
        let source = self.source.clone();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(
            async move {
                let mut last_seen: Option<BlockHash> = None;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = tx.closed() => break,
                    }
                    let best = match source.get_chain_summary().await {
                        Ok(summary) => summary.best_block_hash,
                        Err(err) => {
                            warn!(error = %err, "Failed to poll best block");
                            continue;
                        }
                    };
                    trace!(%best, "Polled best block");
                    // The first observation only establishes a baseline.
                    let changed = last_seen
                        .as_ref()
                        .is_some_and(|last| *last != best);
                    if changed && tx.send(best.clone()).await.is_err() {
                        break;
                    }
                    last_seen = Some(best);
                }
                debug!("Subscriber gone, best block poller stopped");
            }
            .instrument(tracing::info_span!("best_block_poller", topic = HASHBLOCK_TOPIC)),
        );

        info!(topic, poll_interval = ?self.poll_interval, "Subscribed to best block poller");
        Ok(rx)
    }
}
