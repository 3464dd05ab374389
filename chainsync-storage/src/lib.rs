//! Chain repositories.
//!
//! The synchronizer only needs the three atomic tip operations of
//! [`ChainRepository`](chainsync_common::traits::ChainRepository). The in-memory repository
//! provided here keeps everything behind a single lock, which makes each of those operations
//! trivially atomic, and adds the lookups a downstream consumer usually wants.
pub mod memory;

pub use memory::MemoryChainRepository;
