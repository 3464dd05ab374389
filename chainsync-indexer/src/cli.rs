use chainsync_common::{models::Chain, Bytes};
use clap::{Args, Parser, Subcommand};

/// Chainsync
///
/// Follows the canonical chain of a bitcoind node and mirrors it into local storage, repairing
/// reorganisations as they happen.
#[derive(Parser, PartialEq, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    global_args: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn args(&self) -> GlobalArgs {
        self.global_args.clone()
    }

    pub fn command(&self) -> Command {
        self.command.clone()
    }
}

#[derive(Subcommand, Clone, PartialEq, Debug)]
pub enum Command {
    /// Starts synchronizing until interrupted.
    Sync(SyncArgs),
    /// Prints the node's chain summary and exits.
    Summary,
}

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(version, about, long_about = None)]
pub struct GlobalArgs {
    /// The JSON-RPC URL of the bitcoind node
    #[clap(env = "RPC_URL", long, hide_env_values = true, default_value = "http://127.0.0.1:8332")]
    pub rpc_url: String,

    /// RPC user for basic authentication
    #[clap(env = "RPC_USER", long)]
    pub rpc_user: Option<String>,

    /// RPC password for basic authentication
    #[clap(env = "RPC_PASSWORD", long, hide_env_values = true)]
    pub rpc_password: Option<String>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct SyncArgs {
    /// The network to follow. Overrides the config file.
    #[clap(long)]
    pub chain: Option<Chain>,

    /// Genesis block hash, for networks not known by name.
    #[clap(long)]
    pub genesis_hash: Option<Bytes>,

    /// Synchronizer configuration file
    #[clap(long, env = "CHAINSYNC_CONFIG")]
    pub config: Option<String>,

    /// Seconds to wait for a new block notification before asking the node again
    #[clap(long)]
    pub new_block_timeout_secs: Option<u64>,

    /// How often the node is polled for a new best block, in milliseconds
    #[clap(long)]
    pub poll_interval_ms: Option<u64>,

    /// Serve prometheus metrics on this port
    #[clap(long)]
    pub metrics_port: Option<u16>,
}
