//! Simulated peer network and header feed for running the node without a
//! real p2p stack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chain::config::DEFAULT_CHAIN_CONFIG;
use chain::{ChainIndexer, HeaderChain};
use containers::{Block, Bytes32, ChainPosition, Height, Transaction};
use networking::PeerId;
use networking::puller::{BlockFetcher, PullerNotifier};
use parking_lot::RwLock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub initial_blocks: u64,
    pub block_interval: Duration,
    pub reorg_rate: f64,
    pub max_reorg_depth: u64,
}

/// Blocks every simulated peer can serve.
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    blocks: Arc<RwLock<HashMap<Bytes32, Block>>>,
    max_delay: Duration,
    failure_rate: f64,
}

impl SimulatedNetwork {
    pub fn new(max_delay: Duration, failure_rate: f64) -> Self {
        Self {
            blocks: Arc::default(),
            max_delay,
            failure_rate,
        }
    }

    pub fn publish(&self, blocks: &[Block]) {
        let mut known = self.blocks.write();
        for block in blocks {
            known.insert(block.hash(), block.clone());
        }
    }
}

#[async_trait]
impl BlockFetcher for SimulatedNetwork {
    async fn fetch_block(&self, peer_id: PeerId, hash: Bytes32) -> Option<Block> {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            let max_millis = self.max_delay.as_millis().max(1) as u64;
            (
                Duration::from_millis(rng.gen_range(0..max_millis)),
                rng.gen_bool(self.failure_rate),
            )
        };
        tokio::time::sleep(delay).await;
        if fail {
            debug!(peer = %peer_id, hash = %hash.short(), "Simulated peer dropped request");
            return None;
        }
        self.blocks.read().get(&hash).cloned()
    }
}

/// Produces blocks on top of the best chain and now and then replaces the
/// last few with a competing branch.
pub struct BlockProducer {
    chain: Arc<HeaderChain>,
    network: SimulatedNetwork,
    blocks: HashMap<Bytes32, Block>,
    config: SimulationConfig,
    genesis_time: u64,
    salt: u8,
}

impl BlockProducer {
    pub fn new(genesis: &Block, chain: Arc<HeaderChain>, network: SimulatedNetwork, config: SimulationConfig) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(genesis.hash(), genesis.clone());
        Self {
            chain,
            network,
            blocks,
            config,
            genesis_time: genesis.header.timestamp,
            salt: 0,
        }
    }

    fn tip_block(&self) -> Option<&Block> {
        self.blocks.get(&self.chain.tip().hash)
    }

    fn build_on(&mut self, parent: ChainPosition, len: u64) -> Vec<Block> {
        let mut branch = Vec::with_capacity(len as usize);
        let mut parent = parent;
        for _ in 0..len {
            let height = parent.height.next();
            // Deterministic content, so a restarted node finds its stored
            // blocks on the rebuilt chain.
            let transactions = (0..height.0 % 7 + 1)
                .map(|index| Transaction(format!("{}:{}:{index}", height.0, self.salt).into_bytes()))
                .collect();
            let timestamp = self.genesis_time
                + height.0 * DEFAULT_CHAIN_CONFIG.target_block_spacing_secs
                + self.salt as u64;
            let block = Block::new(height, parent.hash, timestamp, transactions);
            parent = block.position();
            self.blocks.insert(block.hash(), block.clone());
            branch.push(block);
        }
        branch
    }

    fn extend_tip(&mut self, len: u64) -> anyhow::Result<()> {
        let parent = self
            .tip_block()
            .map(Block::position)
            .ok_or_else(|| anyhow::anyhow!("best chain tip is unknown to the producer"))?;
        let branch = self.build_on(parent, len);
        self.network.publish(&branch);
        for block in &branch {
            self.chain.push(block.position())?;
        }
        Ok(())
    }

    fn reorganize(&mut self, depth: u64) -> anyhow::Result<()> {
        let tip = self.chain.tip();
        let fork_height = Height(tip.height.0.saturating_sub(depth).max(1));
        let parent = self
            .chain
            .get_header_at(Height(fork_height.0 - 1))
            .ok_or_else(|| anyhow::anyhow!("no header at fork parent {}", fork_height.0 - 1))?;

        self.salt = self.salt.wrapping_add(1);
        let branch = self.build_on(parent, depth + 1);
        self.network.publish(&branch);
        let positions: Vec<ChainPosition> = branch.iter().map(Block::position).collect();
        self.chain.apply_branch(&positions)?;
        info!(fork_height = fork_height.0, depth, "Simulated best chain reorg");
        Ok(())
    }

    /// Build the chain the node starts out behind.
    pub fn publish_initial_chain(&mut self) -> anyhow::Result<()> {
        self.extend_tip(self.config.initial_blocks)?;
        info!(height = self.chain.tip().height.0, "Simulated chain published");
        Ok(())
    }

    /// Connect the peers, then keep producing until cancelled.
    pub async fn run(mut self, notifier: PullerNotifier, peers: Vec<PeerId>, shutdown: CancellationToken) {
        for peer in &peers {
            notifier.peer_connected(*peer, Some(self.chain.tip().height));
        }

        let mut interval = tokio::time::interval(self.config.block_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let reorg_depth = {
                let mut rng = rand::thread_rng();
                rng.gen_bool(self.config.reorg_rate)
                    .then(|| rng.gen_range(1..=self.config.max_reorg_depth.max(1)))
            };
            let result = match reorg_depth {
                Some(depth) => self.reorganize(depth),
                None => self.extend_tip(1),
            };
            if let Err(err) = result {
                warn!(%err, "Simulated block production failed");
                continue;
            }

            let height = self.chain.tip().height;
            for peer in &peers {
                notifier.peer_status(*peer, height);
            }
        }
    }
}
