//! # Chain data over JSON-RPC
//!
//! Reference collaborators for the synchronizer talking to a bitcoind compatible node:
//! [`JsonRpcChainDataSource`] answers block and chain queries, [`BestBlockPoller`] emulates a
//! new block notification channel by polling the node's best block hash.
use chainsync_common::models::error::DataSourceError;
use thiserror::Error;

pub mod poller;
pub mod rpc;

pub use poller::BestBlockPoller;
pub use rpc::{
    config::{JsonRpcClientOptions, RPCRetryConfig},
    JsonRpcChainDataSource,
};

/// bitcoind: requested height is out of range.
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// bitcoind: block (or transaction) not found.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// bitcoind: node is still loading its block index.
pub const RPC_IN_WARMUP: i64 = -28;

#[derive(Error, Debug)]
pub enum RPCError {
    /// The client could not be constructed, e.g. the url failed to parse.
    #[error("RPC setup error: {0}")]
    SetupError(String),

    /// Errors forwarded from the HTTP protocol.
    #[error("Request error: {0}")]
    RequestError(String, #[source] reqwest::Error),

    /// The node answered but the payload did not have the expected shape.
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// The node answered with a JSON-RPC error object.
    #[error("Node error {code}: {message}")]
    NodeError { code: i64, message: String },

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),
}

impl RPCError {
    /// Whether the node reported the requested height or hash as unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RPCError::NodeError { code, .. }
                if *code == RPC_INVALID_PARAMETER || *code == RPC_INVALID_ADDRESS_OR_KEY
        )
    }
}

impl From<RPCError> for DataSourceError {
    fn from(value: RPCError) -> Self {
        match value {
            RPCError::RequestError(..) | RPCError::ServerUnreachable(_) => {
                DataSourceError::Transport(value.to_string())
            }
            RPCError::ParseError(_) => DataSourceError::InvalidResponse(value.to_string()),
            RPCError::SetupError(_) | RPCError::NodeError { .. } => {
                DataSourceError::Unknown(value.to_string())
            }
        }
    }
}
