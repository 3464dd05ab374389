use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Context};
use chainsync_common::traits::ChainDataSource;
use chainsync_indexer::{
    cli::{Cli, Command, GlobalArgs, SyncArgs},
    config::SyncConfig,
    synchronizer::{ChannelFaultHandler, Synchronizer},
};
use chainsync_rpc::{BestBlockPoller, JsonRpcChainDataSource, JsonRpcClientOptions};
use chainsync_storage::memory::MemoryChainRepository;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), anyhow::Error> {
    let cli: Cli = Cli::parse();
    let global_args = cli.args();
    match cli.command() {
        Command::Sync(sync_args) => run_sync(global_args, sync_args)?,
        Command::Summary => run_summary(global_args)?,
    };
    Ok(())
}

fn create_tracing_subscriber() {
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn create_metrics_exporter(port: u16) -> Result<(), anyhow::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow!("Failed to install prometheus exporter: {e}"))?;
    info!(%addr, "Serving metrics");
    Ok(())
}

fn create_data_source(
    global_args: &GlobalArgs,
    config: Option<&SyncConfig>,
) -> Result<JsonRpcChainDataSource, anyhow::Error> {
    let mut options = JsonRpcClientOptions::new()
        .with_auth(global_args.rpc_user.clone(), global_args.rpc_password.clone());
    if let Some(config) = config {
        options = options
            .with_retry_config(config.rpc.retry.clone())
            .with_timeout(config.rpc.timeout());
    }
    JsonRpcChainDataSource::new(&global_args.rpc_url, options)
        .context("Failed to set up the rpc client")
}

#[tokio::main]
async fn run_sync(global_args: GlobalArgs, sync_args: SyncArgs) -> Result<(), anyhow::Error> {
    create_tracing_subscriber();
    let config = SyncConfig::load(&sync_args)?;
    debug!(?config, "Loaded configuration");

    if let Some(port) = config.metrics_port {
        create_metrics_exporter(port)?;
    }

    let source: Arc<dyn ChainDataSource> =
        Arc::new(create_data_source(&global_args, Some(&config))?);
    match source.get_chain_summary().await {
        Ok(summary) if summary.chain != config.chain.node_name() => {
            warn!(
                node_chain = %summary.chain,
                configured = %config.chain,
                "Node reports a different chain than configured"
            );
        }
        Ok(summary) => info!(height = summary.height, "Connected to node"),
        Err(error) => warn!(%error, "Node not reachable yet, retrying once synchronization starts"),
    }

    let notifications = Arc::new(BestBlockPoller::new(source.clone(), config.rpc.poll_interval()));
    let repository = Arc::new(MemoryChainRepository::new());
    let (fault_handler, mut faults) = ChannelFaultHandler::new();

    let synchronizer = Synchronizer::new(
        source,
        notifications,
        repository.clone(),
        config.genesis_hash(),
        config.retriever.clone(),
    )
    .with_fault_handler(Arc::new(fault_handler));
    synchronizer.on_block_added(|event| {
        info!(height = event.height, hash = %event.block.hash, "Block added");
    });
    synchronizer.on_block_removing(|event| {
        warn!(height = event.height, hash = %event.block.hash, "Block removing");
    });

    info!(chain = %config.chain, genesis = %config.genesis_hash(), "Starting chainsync");
    synchronizer.start().await?;

    let res = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            signal.context("Failed to listen for ctrl-c")
        }
        Some(fault) = faults.recv() => {
            error!(%fault, "Synchronizer faulted, shutting down");
            Err(anyhow!(fault))
        }
    };

    synchronizer.dispose().await;
    info!(tip = ?repository.height().await, "Synchronizer stopped");
    res
}

#[tokio::main]
async fn run_summary(global_args: GlobalArgs) -> Result<(), anyhow::Error> {
    create_tracing_subscriber();
    let source = create_data_source(&global_args, None)?;
    let summary = source
        .get_chain_summary()
        .await
        .context("Failed to fetch chain summary")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
