pub mod blockchain;
pub mod error;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::Bytes;

/// Block hash literal type to uniquely identify a block in the chain.
pub type BlockHash = Bytes;

/// Transaction hash literal type to uniquely identify a transaction in the chain.
pub type TxHash = Bytes;

/// Position of a block on the canonical chain. Genesis sits at height 0.
pub type Height = u64;

/// Networks the synchronizer knows the genesis block of.
///
/// Hashes use the byte order bitcoind reports over RPC.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chain {
    #[default]
    Bitcoin,
    Testnet,
    Regtest,
}

impl Chain {
    pub fn genesis_hash(&self) -> BlockHash {
        match self {
            Chain::Bitcoin => {
                Bytes::from("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
            }
            Chain::Testnet => {
                Bytes::from("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943")
            }
            Chain::Regtest => {
                Bytes::from("0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206")
            }
        }
    }

    /// Name bitcoind reports in the `chain` field of `getblockchaininfo`.
    pub fn node_name(&self) -> &'static str {
        match self {
            Chain::Bitcoin => "main",
            Chain::Testnet => "test",
            Chain::Regtest => "regtest",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("bitcoin", Chain::Bitcoin)]
    #[case("testnet", Chain::Testnet)]
    #[case("regtest", Chain::Regtest)]
    fn test_chain_from_str(#[case] input: &str, #[case] expected: Chain) {
        assert_eq!(Chain::from_str(input).expect("parse chain"), expected);
        assert_eq!(expected.to_string(), input);
    }

    #[test]
    fn test_genesis_hashes_are_32_bytes() {
        for chain in [Chain::Bitcoin, Chain::Testnet, Chain::Regtest] {
            assert_eq!(chain.genesis_hash().len(), 32);
        }
    }
}
