use std::fmt::{Display, Formatter};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{BlockHash, Height, TxHash};
use crate::Bytes;

#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Debug)]
pub struct Block {
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub ts: NaiveDateTime,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(
        hash: BlockHash,
        parent_hash: BlockHash,
        ts: NaiveDateTime,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block { hash, parent_hash, ts, transactions }
    }

    /// Whether `self` directly extends `parent`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.parent_hash == parent.hash
    }
}

impl Display for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (parent: {}, txs: {})", self.hash, self.parent_hash, self.transactions.len())
    }
}

/// A transaction as carried inside a block. The raw payload is opaque to the synchronizer.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Debug)]
pub struct Transaction {
    pub hash: TxHash,
    pub index: u64,
    pub raw: Bytes,
}

impl Transaction {
    pub fn new(hash: TxHash, index: u64, raw: Bytes) -> Self {
        Transaction { hash, index, raw }
    }
}

/// The highest block currently persisted locally together with its height.
#[derive(Clone, Default, PartialEq, Debug)]
pub struct ChainTip {
    pub block: Block,
    pub height: Height,
}

impl ChainTip {
    pub fn new(block: Block, height: Height) -> Self {
        ChainTip { block, height }
    }

    /// The height a block extending this tip is expected at.
    pub fn next_height(&self) -> Height {
        self.height + 1
    }
}

/// Point-in-time summary of the remote node's chain.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize, Debug)]
pub struct ChainSummary {
    pub chain: String,
    pub height: Height,
    pub best_block_hash: BlockHash,
}

impl ChainSummary {
    pub fn new(chain: &str, height: Height, best_block_hash: BlockHash) -> Self {
        ChainSummary { chain: chain.to_owned(), height, best_block_hash }
    }
}

/// A block together with its height, handed to subscribers when a block is added to or about
/// to be removed from local storage.
#[derive(Clone, PartialEq, Debug)]
pub struct BlockEvent {
    pub block: Block,
    pub height: Height,
}

impl BlockEvent {
    pub fn new(block: Block, height: Height) -> Self {
        BlockEvent { block, height }
    }
}

impl Display for BlockEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.height, self.block.hash)
    }
}

impl From<ChainTip> for BlockEvent {
    fn from(tip: ChainTip) -> Self {
        BlockEvent::new(tip.block, tip.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extends() {
        let block = |hash: &str, parent: &str| Block {
            hash: Bytes::from(hash),
            parent_hash: Bytes::from(parent),
            ..Default::default()
        };
        let parent = block("0x01", "0x00");
        let child = block("0x02", "0x01");
        let orphan = block("0x03", "0x09");

        assert!(child.extends(&parent));
        assert!(!orphan.extends(&parent));
    }

    #[test]
    fn test_tip_next_height_and_event() {
        let tip = ChainTip::new(Block { hash: Bytes::from("0xaa"), ..Default::default() }, 41);

        assert_eq!(tip.next_height(), 42);
        assert_eq!(BlockEvent::from(tip).to_string(), "#41 0xaa");
    }
}
