use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chain::{ChainIndexer, ChainState};
use containers::{Block, Bytes32, ChainPosition, Height, PendingBlock};
use metrics::SharedMetrics;
use networking::puller::{BlockFetcher, BlockPuller, PullerNotifier};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::pending::PendingStorage;
use crate::repository::BlockRepository;
use crate::steps::{self, rewind_to_best_chain, FlushDeferral, StepContext, StepResult, SyncStep};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopPhase {
    Syncing,
    Idle,
    Reorganizing,
    Stopped,
}

impl LoopPhase {
    pub fn as_i64(self) -> i64 {
        match self {
            LoopPhase::Syncing => 0,
            LoopPhase::Idle => 1,
            LoopPhase::Reorganizing => 2,
            LoopPhase::Stopped => 3,
        }
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Syncing => "syncing",
            LoopPhase::Idle => "idle",
            LoopPhase::Reorganizing => "reorganizing",
            LoopPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of the loop, refreshed after every tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub tip_height: Height,
    pub chain_tip_height: Height,
    pub pending: usize,
    pub pending_bytes: usize,
    pub in_flight: usize,
}

/// Changes to the repository tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A batch of `blocks` was written and `tip` is the new tip.
    TipAdvanced { tip: ChainPosition, blocks: usize },
    /// The tip was rewound onto the best chain.
    TipRewound {
        from: ChainPosition,
        to: ChainPosition,
    },
}

/// Drives the synchronization steps.
///
/// Owns pending storage and the block puller. One task calls `run`; other
/// parts of the node talk to the loop through [`BlockStoreHandle`] and the
/// puller's notifier.
pub struct BlockStoreLoop<F: BlockFetcher> {
    repository: Arc<dyn BlockRepository>,
    chain: Arc<dyn ChainIndexer>,
    chain_state: Arc<ChainState>,
    pending: Arc<Mutex<PendingStorage>>,
    puller: BlockPuller<F>,
    config: StoreConfig,
    events: broadcast::Sender<StoreEvent>,
    status: Arc<RwLock<LoopStatus>>,
    metrics: Option<SharedMetrics>,
    shutdown: CancellationToken,
    deferral: FlushDeferral,
    last_stats: Instant,
}

impl<F: BlockFetcher> BlockStoreLoop<F> {
    /// Build the loop and reconcile the repository tip with the best chain,
    /// rewinding a tip left on an abandoned branch by an earlier run.
    pub fn new(
        repository: Arc<dyn BlockRepository>,
        chain: Arc<dyn ChainIndexer>,
        chain_state: Arc<ChainState>,
        puller: BlockPuller<F>,
        config: StoreConfig,
    ) -> Result<Self> {
        if let Some(rewind) =
            rewind_to_best_chain(repository.as_ref(), chain.as_ref(), config.max_reorg_depth)?
        {
            warn!(
                from = rewind.from.height.0,
                to = rewind.to.height.0,
                "Stored tip was not on the best chain, rewound"
            );
        }

        let tip = repository.tip();
        info!(
            tip = tip.height.0,
            hash = %tip.hash.short(),
            chain_tip = chain.tip().height.0,
            "Block store loop ready"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let status = LoopStatus {
            phase: LoopPhase::Syncing,
            tip_height: tip.height,
            chain_tip_height: chain.tip().height,
            pending: 0,
            pending_bytes: 0,
            in_flight: 0,
        };

        Ok(Self {
            pending: Arc::new(Mutex::new(PendingStorage::new(
                config.max_pending_blocks,
                config.max_pending_bytes,
            ))),
            repository,
            chain,
            chain_state,
            puller,
            config,
            events,
            status: Arc::new(RwLock::new(status)),
            metrics: None,
            shutdown: CancellationToken::new(),
            deferral: FlushDeferral::default(),
            last_stats: Instant::now(),
        })
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> BlockStoreHandle {
        BlockStoreHandle {
            repository: Arc::clone(&self.repository),
            chain: Arc::clone(&self.chain),
            pending: Arc::clone(&self.pending),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
        }
    }

    /// Handle the networking layer uses to report peers and deliveries.
    pub fn notifier(&self) -> PullerNotifier {
        self.puller.notifier()
    }

    pub fn puller(&self) -> &BlockPuller<F> {
        &self.puller
    }

    pub fn repository(&self) -> &Arc<dyn BlockRepository> {
        &self.repository
    }

    pub fn get_pending(&self, hash: &Bytes32) -> Option<PendingBlock> {
        self.pending.lock().get(hash).cloned()
    }

    pub fn status(&self) -> LoopStatus {
        self.status.read().clone()
    }

    /// Run the pipeline once.
    pub fn tick(&mut self) -> Result<StepResult> {
        let mut ctx = StepContext {
            repository: self.repository.as_ref(),
            chain: self.chain.as_ref(),
            chain_state: self.chain_state.as_ref(),
            pending: self.pending.as_ref(),
            puller: &mut self.puller,
            config: &self.config,
            events: &self.events,
            metrics: self.metrics.as_deref(),
            deferral: &mut self.deferral,
        };
        let outcome = steps::run_tick(&mut ctx, &self.shutdown)?;

        let phase = match (outcome.result, outcome.step) {
            (StepResult::Stop, _) => LoopPhase::Stopped,
            (_, Some(step)) => step.phase(),
            (_, None) => LoopPhase::Idle,
        };
        if let Some(step) = outcome.step {
            debug!(step = step.as_str(), result = ?outcome.result, "Tick");
        }
        self.refresh_status(phase);
        self.maybe_log_stats();

        Ok(outcome.result)
    }

    /// Drive the pipeline until `shutdown` is cancelled or a step fails.
    ///
    /// A tick is never interrupted; a pause ends early on shutdown.
    /// Requests still in flight are abandoned on exit.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.shutdown = shutdown;
        info!("Block store loop started");

        let result = loop {
            match self.tick() {
                Ok(StepResult::Continue) => tokio::task::yield_now().await,
                Ok(StepResult::Pause(duration)) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Ok(StepResult::Stop) => break Ok(()),
                Err(err) => {
                    error!(%err, "Block store loop failed");
                    break Err(err);
                }
            }
        };

        let abandoned = self.puller.abandon_all();
        self.refresh_status(LoopPhase::Stopped);
        info!(
            tip = self.repository.tip().height.0,
            abandoned,
            "Block store loop stopped"
        );
        result
    }

    fn refresh_status(&self, phase: LoopPhase) {
        let tip = self.repository.tip();
        let chain_tip = self.chain.tip();
        let (pending, pending_bytes) = {
            let pending = self.pending.lock();
            (pending.len(), pending.size_bytes())
        };
        let stats = self.puller.stats();

        *self.status.write() = LoopStatus {
            phase,
            tip_height: tip.height,
            chain_tip_height: chain_tip.height,
            pending,
            pending_bytes,
            in_flight: stats.in_flight,
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_store_tip_height(tip.height.0 as i64);
            metrics.set_chain_tip_height(chain_tip.height.0 as i64);
            metrics.set_pending(pending as i64, pending_bytes as i64);
            metrics.set_sync_phase(phase.as_i64());
            metrics.set_requests_in_flight(stats.in_flight as i64);
            metrics.set_peers(stats.peers.connected as i64);
            metrics.sync_delivery_totals(stats.delivered_total, &stats.failures_by_reason);
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed() < self.config.stats_interval {
            return;
        }
        self.last_stats = Instant::now();

        let status = self.status();
        let stats = self.puller.stats();
        info!(
            phase = %status.phase,
            tip = status.tip_height.0,
            chain_tip = status.chain_tip_height.0,
            pending = status.pending,
            pending_bytes = status.pending_bytes,
            in_flight = status.in_flight,
            peers = stats.peers.connected,
            delivered = stats.delivered_total,
            failed = stats.failed_total,
            ibd = self.chain_state.is_initial_block_download(),
            "Block store status"
        );
    }
}

/// Clonable access to the loop for the rest of the node.
#[derive(Clone)]
pub struct BlockStoreHandle {
    repository: Arc<dyn BlockRepository>,
    chain: Arc<dyn ChainIndexer>,
    pending: Arc<Mutex<PendingStorage>>,
    status: Arc<RwLock<LoopStatus>>,
    events: broadcast::Sender<StoreEvent>,
}

impl BlockStoreHandle {
    /// A block being flushed stays visible here until the repository has
    /// committed it.
    pub fn get_pending(&self, hash: &Bytes32) -> Option<PendingBlock> {
        self.pending.lock().get(hash).cloned()
    }

    /// Buffer a block that arrived without being requested.
    ///
    /// Accepted only when the block matches `hash` and `position`, the
    /// position is on the best chain above the repository tip, and the
    /// buffer has room.
    pub fn add_to_pending(&self, hash: Bytes32, block: Block, position: ChainPosition) -> bool {
        if block.hash() != hash || position.hash != hash || block.position() != position {
            debug!(hash = %hash.short(), "Rejecting block that does not match its position");
            return false;
        }
        if !self.chain.contains(&position) {
            debug!(hash = %hash.short(), height = position.height.0, "Rejecting block off the best chain");
            return false;
        }
        if position.height <= self.repository.tip().height {
            return false;
        }
        self.pending
            .lock()
            .try_add(hash, PendingBlock::new(block, position))
    }

    pub fn repository(&self) -> Arc<dyn BlockRepository> {
        Arc::clone(&self.repository)
    }

    pub fn status(&self) -> LoopStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
