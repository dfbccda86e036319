mod simulation;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use block_store::{
    BlockRepository, BlockStoreHandle, BlockStoreLoop, FjallBlockRepository, MemoryBlockRepository,
    StoreConfig,
};
use chain::config::DEFAULT_CHAIN_CONFIG;
use chain::{ChainState, HeaderChain};
use clap::Parser;
use containers::GenesisConfig;
use metrics::server::{MetricsServerConfig, run_metrics_server};
use metrics::{Metrics, SharedMetrics};
use networking::PeerId;
use networking::puller::{BlockPuller, PullerConfig};
use serde::Deserialize;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::simulation::{BlockProducer, SimulatedNetwork, SimulationConfig};

/// Leave initial block download once the store is this close to the best
/// chain tip.
const IBD_EXIT_DISTANCE: u64 = 16;

#[derive(Parser, Debug)]
struct Args {
    /// Directory of the block database.
    #[arg(short, long, default_value = "./block-store")]
    data_dir: PathBuf,

    /// YAML file with `store` and `puller` sections.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML genesis file.
    #[arg(short, long)]
    genesis: Option<PathBuf>,

    #[arg(long)]
    clear_on_start: bool,

    /// Keep blocks in memory instead of on disk.
    #[arg(long)]
    in_memory: bool,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 5054)]
    metrics_port: u16,

    #[arg(long)]
    disable_metrics: bool,

    #[arg(long, default_value_t = 2000)]
    simulate_blocks: u64,

    #[arg(long, default_value_t = 4)]
    peers: usize,

    #[arg(long, default_value_t = 4000)]
    block_interval_ms: u64,

    #[arg(long, default_value_t = 0.02)]
    failure_rate: f64,

    #[arg(long, default_value_t = 0.1)]
    reorg_rate: f64,
}

impl Args {
    fn validate(&self) -> Result<()> {
        for (name, rate) in [("failure-rate", self.failure_rate), ("reorg-rate", self.reorg_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("--{name} must be within [0, 1], got {rate}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeConfig {
    store: StoreConfig,
    puller: PullerConfig,
}

impl NodeConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// Flip the IBD flag as the store approaches the best chain tip.
async fn track_initial_block_download(
    handle: BlockStoreHandle,
    chain_state: Arc<ChainState>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let status = handle.status();
        let behind = status.chain_tip_height.distance_from(status.tip_height);
        let ibd = behind > IBD_EXIT_DISTANCE;
        if ibd != chain_state.is_initial_block_download() {
            chain_state.set_initial_block_download(ibd, SystemTime::now());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    args.validate()?;
    let config = NodeConfig::load(args.config.as_ref())?;
    let genesis_config = match &args.genesis {
        Some(path) => GenesisConfig::load_from_file(path)
            .map_err(|err| anyhow::anyhow!("failed to load genesis {}: {err}", path.display()))?,
        None => GenesisConfig::default(),
    };
    let genesis = genesis_config.genesis_block();
    info!(hash = %genesis.hash(), "Genesis block");

    let repository: Arc<dyn BlockRepository> = if args.in_memory {
        Arc::new(MemoryBlockRepository::new(genesis.clone()))
    } else {
        Arc::new(FjallBlockRepository::open(&args.data_dir, &genesis, args.clear_on_start)?)
    };

    let stored_tip_time = repository
        .get(&repository.tip().hash)?
        .map_or(0, |block| block.header.timestamp);
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let chain_state = Arc::new(ChainState::new(
        DEFAULT_CHAIN_CONFIG.is_tip_stale(stored_tip_time, now),
    ));
    let chain = Arc::new(HeaderChain::new(genesis.position()));
    let network = SimulatedNetwork::new(Duration::from_millis(50), args.failure_rate);
    let puller = BlockPuller::new(network.clone(), config.puller);

    let shutdown = CancellationToken::new();
    let metrics: SharedMetrics = Arc::new(Metrics::new());

    // Headers first: the loop reconciles its stored tip against this view.
    let mut producer = BlockProducer::new(
        &genesis,
        Arc::clone(&chain),
        network,
        SimulationConfig {
            initial_blocks: args.simulate_blocks,
            block_interval: Duration::from_millis(args.block_interval_ms),
            reorg_rate: args.reorg_rate,
            max_reorg_depth: 3,
        },
    );
    producer.publish_initial_chain()?;

    let store = BlockStoreLoop::new(
        repository,
        chain,
        Arc::clone(&chain_state),
        puller,
        config.store,
    )?
    .with_metrics(Arc::clone(&metrics));
    let handle = store.handle();
    let notifier = store.notifier();

    if !args.disable_metrics {
        let metrics_config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: args.metrics_port,
        };
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();
        task::spawn(async move {
            if let Err(err) = run_metrics_server(metrics_config, metrics, shutdown).await {
                warn!(%err, "Metrics server exited with error");
            }
        });
    }

    let peers: Vec<PeerId> = (0..args.peers).map(|_| PeerId::random()).collect();
    let producer_handle = task::spawn(producer.run(notifier, peers, shutdown.clone()));
    task::spawn(track_initial_block_download(
        handle.clone(),
        chain_state,
        shutdown.clone(),
    ));
    let mut store_handle = task::spawn(store.run(shutdown.clone()));

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            shutdown.cancel();
            (&mut store_handle).await
        }
        result = &mut store_handle => {
            shutdown.cancel();
            result
        }
    };
    let _ = producer_handle.await;

    let status = handle.status();
    info!(tip = status.tip_height.0, pending = status.pending, "Block store node exiting");

    result.context("block store task panicked")??;
    Ok(())
}
