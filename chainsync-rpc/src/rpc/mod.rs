use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chainsync_common::{
    models::{
        blockchain::{Block, ChainSummary, Transaction},
        error::DataSourceError,
        BlockHash, Height,
    },
    traits::ChainDataSource,
    Bytes,
};
use reqwest::{header, Client, ClientBuilder, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{instrument, trace};

use crate::RPCError;

pub mod config;
mod retry;

use config::JsonRpcClientOptions;
use retry::RetryPolicy;

/// Verbosity of `getblock` that includes decoded transactions together with their raw hex.
const BLOCK_VERBOSITY_WITH_TXS: u8 = 2;

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct RpcBlock {
    hash: String,
    /// Absent on the genesis block.
    previousblockhash: Option<String>,
    time: i64,
    #[serde(default)]
    tx: Vec<RpcTransaction>,
}

#[derive(Deserialize, Debug)]
struct RpcTransaction {
    txid: String,
    hex: String,
}

#[derive(Deserialize, Debug)]
struct RpcBlockchainInfo {
    chain: String,
    blocks: Height,
    bestblockhash: String,
}

fn parse_bytes(field: &str, value: &str) -> Result<Bytes, RPCError> {
    Bytes::from_str(value).map_err(|e| RPCError::ParseError(format!("{field}: {e}")))
}

impl TryFrom<RpcBlock> for Block {
    type Error = RPCError;

    fn try_from(value: RpcBlock) -> Result<Self, Self::Error> {
        let hash = parse_bytes("hash", &value.hash)?;
        let parent_hash = match value.previousblockhash.as_deref() {
            Some(parent) => parse_bytes("previousblockhash", parent)?,
            None => Bytes::zero(hash.len()),
        };
        let ts = chrono::DateTime::from_timestamp(value.time, 0)
            .ok_or_else(|| RPCError::ParseError(format!("time out of range: {}", value.time)))?
            .naive_utc();
        let transactions = value
            .tx
            .iter()
            .enumerate()
            .map(|(index, tx)| {
                Ok(Transaction::new(
                    parse_bytes("txid", &tx.txid)?,
                    index as u64,
                    parse_bytes("hex", &tx.hex)?,
                ))
            })
            .collect::<Result<Vec<_>, RPCError>>()?;

        Ok(Block::new(hash, parent_hash, ts, transactions))
    }
}

/// A [`ChainDataSource`] backed by a bitcoind compatible JSON-RPC endpoint.
///
/// Transient failures are retried according to the configured
/// [`RPCRetryConfig`](config::RPCRetryConfig). Unknown heights and hashes are reported as `None`.
/// It is cheap to clone, the underlying http client is reference counted.
#[derive(Clone, Debug)]
pub struct JsonRpcChainDataSource {
    http_client: Client,
    url: Url,
    auth: Option<(String, String)>,
    retry_policy: RetryPolicy,
    request_id: Arc<AtomicU64>,
}

impl JsonRpcChainDataSource {
    pub fn new(rpc_url: &str, options: JsonRpcClientOptions) -> Result<Self, RPCError> {
        let url = rpc_url
            .parse::<Url>()
            .map_err(|e| RPCError::SetupError(format!("Invalid RPC URL {rpc_url}: {e}")))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        let user_agent = format!("chainsync-{version}", version = env!("CARGO_PKG_VERSION"));
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&user_agent)
                .map_err(|e| RPCError::SetupError(format!("Invalid user agent format: {e}")))?,
        );

        let mut builder = ClientBuilder::new().default_headers(headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder
            .build()
            .map_err(|e| RPCError::SetupError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            url,
            auth: options.auth,
            retry_policy: RetryPolicy::from(&options.retry_config),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Sends a single JSON-RPC call, retrying transient failures.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RPCError> {
        self.retry_policy
            .retry_request(|| self.send(method, params.clone()))
            .await
    }

    async fn send<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RPCError> {
        let id = self
            .request_id
            .fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "1.0", "id": id, "method": method, "params": params});
        trace!(%method, id, "Sending node request");

        let mut request = self
            .http_client
            .post(self.url.clone())
            .json(&body);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| RPCError::RequestError(format!("{method} failed"), e))?;

        match response.status() {
            StatusCode::BAD_GATEWAY |
            StatusCode::SERVICE_UNAVAILABLE |
            StatusCode::GATEWAY_TIMEOUT => {
                return Err(RPCError::ServerUnreachable(
                    response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Server Unreachable".to_string()),
                ));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(RPCError::SetupError(format!(
                    "Node rejected credentials with status {}",
                    response.status()
                )));
            }
            // bitcoind reports JSON-RPC errors with 404 or 500 status codes, the body decides.
            _ => {}
        }

        let text = response
            .text()
            .await
            .map_err(|e| RPCError::RequestError(format!("{method} body unreadable"), e))?;
        let parsed: JsonRpcResponse<T> = serde_json::from_str(&text)
            .map_err(|e| RPCError::ParseError(format!("{method}: {e}; body: {text}")))?;

        if let Some(err) = parsed.error {
            return Err(RPCError::NodeError { code: err.code, message: err.message });
        }
        parsed
            .result
            .ok_or_else(|| RPCError::ParseError(format!("{method}: response without result")))
    }

    /// Maps "not found" node errors to `None`.
    fn optional<T>(result: Result<T, RPCError>) -> Result<Option<T>, RPCError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_block_hash(&self, height: Height) -> Result<Option<BlockHash>, RPCError> {
        let hash: Option<String> = Self::optional(
            self.call("getblockhash", json!([height]))
                .await,
        )?;
        hash.map(|hash| parse_bytes("getblockhash", &hash))
            .transpose()
    }

    #[instrument(skip(self))]
    pub async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, RPCError> {
        let block: Option<RpcBlock> = Self::optional(
            self.call("getblock", json!([hex_string(hash), BLOCK_VERBOSITY_WITH_TXS]))
                .await,
        )?;
        block.map(Block::try_from).transpose()
    }

    #[instrument(skip(self))]
    pub async fn get_blockchain_info(&self) -> Result<ChainSummary, RPCError> {
        let info: RpcBlockchainInfo = self
            .call("getblockchaininfo", json!([]))
            .await?;
        Ok(ChainSummary::new(
            &info.chain,
            info.blocks,
            parse_bytes("bestblockhash", &info.bestblockhash)?,
        ))
    }
}

/// Hashes are sent to the node without the `0x` prefix.
fn hex_string(hash: &BlockHash) -> String {
    format!("{hash:x}")
}

#[async_trait]
impl ChainDataSource for JsonRpcChainDataSource {
    async fn get_block_by_height(&self, height: Height) -> Result<Option<Block>, DataSourceError> {
        let Some(hash) = self.get_block_hash(height).await? else {
            return Ok(None);
        };
        // The block may have been reorged away between both calls, which also yields `None`.
        Ok(self.get_block(&hash).await?)
    }

    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, DataSourceError> {
        Ok(self.get_block(hash).await?)
    }

    async fn get_chain_summary(&self) -> Result<ChainSummary, DataSourceError> {
        Ok(self.get_blockchain_info().await?)
    }
}
