use std::{fs, path::Path, time::Duration};

use chainsync_common::{
    models::{BlockHash, Chain},
    Bytes,
};
use chainsync_rpc::RPCRetryConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::{cli::SyncArgs, synchronizer::RetrieverConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings of the JSON-RPC connection to the node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub retry: RPCRetryConfig,
    pub timeout_secs: u64,
    /// Interval of the best block poller used as new block notification source.
    pub poll_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { retry: RPCRetryConfig::default(), timeout_secs: 30, poll_interval_ms: 1000 }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration of a `chainsync sync` run, loaded from yaml and overridden from the command line.
///
/// ```yaml
/// chain: regtest
/// retriever:
///   new_block_timeout_secs: 10
/// rpc:
///   poll_interval_ms: 500
///   retry:
///     max_retries: 5
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub chain: Chain,
    /// Overrides the well known genesis hash of `chain`, e.g. for custom signets.
    pub genesis_hash: Option<Bytes>,
    pub retriever: RetrieverConfig,
    pub rpc: RpcConfig,
    /// Serve prometheus metrics on this port if set.
    pub metrics_port: Option<u16>,
}

impl SyncConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::from_yaml_str(&contents)
    }

    /// Loads the config file named in `args`, if any, and applies the command line overrides.
    pub fn load(args: &SyncArgs) -> Result<Self, ConfigError> {
        let config = match &args.config {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        let config = config.with_overrides(args);
        config.validate()?;
        Ok(config)
    }

    /// All configured durations must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("retriever.new_block_timeout_secs", self.retriever.new_block_timeout),
            ("rpc.poll_interval_ms", self.rpc.poll_interval()),
            ("rpc.timeout_secs", self.rpc.timeout()),
        ];
        match durations
            .into_iter()
            .find(|(_, duration)| duration.is_zero())
        {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be non-zero"))),
            None => Ok(()),
        }
    }

    pub fn with_overrides(mut self, args: &SyncArgs) -> Self {
        if let Some(chain) = args.chain {
            self.chain = chain;
        }
        if let Some(genesis_hash) = &args.genesis_hash {
            self.genesis_hash = Some(genesis_hash.clone());
        }
        if let Some(secs) = args.new_block_timeout_secs {
            self.retriever.new_block_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = args.poll_interval_ms {
            self.rpc.poll_interval_ms = ms;
        }
        if args.metrics_port.is_some() {
            self.metrics_port = args.metrics_port;
        }
        self
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_hash
            .clone()
            .unwrap_or_else(|| self.chain.genesis_hash())
    }
}
