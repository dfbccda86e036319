mod reorganize_tests;

use std::collections::HashMap;
use std::sync::Arc;

use chain::{ChainState, HeaderChain};
use containers::{Block, Bytes32, PendingBlock};
use networking::puller::{BlockFetcher, BlockPuller, PullerConfig};
use networking::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{run_tick, FlushDeferral, StepContext, StepResult, TickOutcome};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::pending::PendingStorage;
use crate::repository::{BlockRepository, MemoryBlockRepository};
use crate::store_loop::StoreEvent;
use crate::tests::helpers::{chain_of, header_chain};

/// Serves every block it knows, or nothing at all when `hang` is set.
#[derive(Clone, Default)]
pub(super) struct MockFetcher {
    blocks: Arc<RwLock<HashMap<Bytes32, Block>>>,
    hang: bool,
}

impl MockFetcher {
    pub fn serving(blocks: &[Block]) -> Self {
        let fetcher = Self::default();
        fetcher.add(blocks);
        fetcher
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn add(&self, blocks: &[Block]) {
        let mut known = self.blocks.write();
        for block in blocks {
            known.insert(block.hash(), block.clone());
        }
    }
}

#[async_trait::async_trait]
impl BlockFetcher for MockFetcher {
    async fn fetch_block(&self, _peer_id: PeerId, hash: Bytes32) -> Option<Block> {
        if self.hang {
            return std::future::pending().await;
        }
        self.blocks.read().get(&hash).cloned()
    }
}

/// Repository seeded with `stored` and a best chain over `best`; both start
/// at the same genesis.
pub(super) struct Harness {
    pub repository: MemoryBlockRepository,
    pub chain: HeaderChain,
    pub chain_state: ChainState,
    pub pending: Mutex<PendingStorage>,
    pub puller: BlockPuller<MockFetcher>,
    pub config: StoreConfig,
    pub events: broadcast::Sender<StoreEvent>,
    pub shutdown: CancellationToken,
    pub deferral: FlushDeferral,
}

impl Harness {
    pub fn new(stored: &[Block], best: &[Block], fetcher: MockFetcher, config: StoreConfig) -> Self {
        let repository = MemoryBlockRepository::new(stored[0].clone());
        if stored.len() > 1 {
            let batch: Vec<PendingBlock> = stored[1..]
                .iter()
                .cloned()
                .map(PendingBlock::from_block)
                .collect();
            repository.put_batch(&batch).unwrap();
        }
        let (events, _) = broadcast::channel(64);
        Self {
            repository,
            chain: header_chain(best),
            chain_state: ChainState::new(false),
            pending: Mutex::new(PendingStorage::new(
                config.max_pending_blocks,
                config.max_pending_bytes,
            )),
            puller: BlockPuller::new(fetcher, PullerConfig::default()),
            config,
            events,
            shutdown: CancellationToken::new(),
            deferral: FlushDeferral::default(),
        }
    }

    pub fn ctx(&mut self) -> StepContext<'_, MockFetcher> {
        StepContext {
            repository: &self.repository,
            chain: &self.chain,
            chain_state: &self.chain_state,
            pending: &self.pending,
            puller: &mut self.puller,
            config: &self.config,
            events: &self.events,
            metrics: None,
            deferral: &mut self.deferral,
        }
    }

    pub fn tick(&mut self) -> Result<TickOutcome> {
        let shutdown = self.shutdown.clone();
        run_tick(&mut self.ctx(), &shutdown)
    }

    pub fn add_pending(&self, blocks: &[Block]) {
        let mut pending = self.pending.lock();
        for block in blocks {
            pending.force_add(block.hash(), PendingBlock::from_block(block.clone()));
        }
    }
}

/// Let spawned fetch tasks finish.
pub(super) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn test_cancelled_token_stops_before_any_step() {
    let blocks = chain_of(3);
    let mut harness = Harness::new(&blocks[..1], &blocks, MockFetcher::default(), StoreConfig::default());
    harness.add_pending(&blocks[1..]);
    harness.shutdown.cancel();

    let outcome = harness.tick().unwrap();
    assert_eq!(outcome.step, None);
    assert_eq!(outcome.result, StepResult::Stop);
    assert_eq!(harness.pending.lock().len(), 3);
}
