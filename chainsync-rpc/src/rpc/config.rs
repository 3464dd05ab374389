use std::time::Duration;

use serde::Deserialize;

/// Configuration for RPC retry behavior
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RPCRetryConfig {
    /// Maximum number of retry attempts for failed requests (default: 3)
    pub max_retries: usize,
    /// Initial backoff delay in milliseconds (default: 100ms)
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 5000ms)
    pub max_backoff_ms: u64,
}

impl RPCRetryConfig {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self { max_retries, initial_backoff_ms, max_backoff_ms }
    }
}

impl Default for RPCRetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, initial_backoff_ms: 100, max_backoff_ms: 5000 }
    }
}

/// Configuration options for [`JsonRpcChainDataSource`](super::JsonRpcChainDataSource)
#[derive(Clone, Debug, Default)]
pub struct JsonRpcClientOptions {
    /// Optional basic auth credentials, bitcoind's `rpcuser` and `rpcpassword`
    pub auth: Option<(String, String)>,
    pub retry_config: RPCRetryConfig,
    /// Per request timeout, no timeout if `None`
    pub timeout: Option<Duration>,
}

impl JsonRpcClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.auth = user.map(|user| (user, password.unwrap_or_default()));
        self
    }

    pub fn with_retry_config(mut self, retry_config: RPCRetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
