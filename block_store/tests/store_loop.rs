use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use block_store::{
    BlockRepository, BlockStoreLoop, FjallBlockRepository, LoopPhase, MemoryBlockRepository,
    StepResult, StoreConfig, StoreEvent,
};
use chain::{ChainIndexer, ChainState, HeaderChain};
use containers::{Block, Bytes32, ChainPosition, Height, Transaction};
use networking::puller::{BlockFetcher, BlockPuller, PullerConfig};
use networking::PeerId;
use parking_lot::RwLock;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn genesis() -> Block {
    Block::new(Height::GENESIS, Bytes32::zero(), 0, vec![])
}

fn extend(parent: &Block, len: u64, salt: u8) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut parent = parent.position();
    for _ in 0..len {
        let height = parent.height.next();
        let block = Block::new(height, parent.hash, height.0, vec![Transaction(vec![salt; 8])]);
        parent = block.position();
        blocks.push(block);
    }
    blocks
}

fn chain_of(len: u64) -> Vec<Block> {
    let genesis = genesis();
    let mut blocks = vec![genesis.clone()];
    blocks.extend(extend(&genesis, len, 0));
    blocks
}

fn positions(blocks: &[Block]) -> Vec<ChainPosition> {
    blocks.iter().map(Block::position).collect()
}

fn header_chain(blocks: &[Block]) -> Arc<HeaderChain> {
    let chain = HeaderChain::new(blocks[0].position());
    for block in &blocks[1..] {
        chain.push(block.position()).unwrap();
    }
    Arc::new(chain)
}

/// Serves known blocks after a per-block delay derived from `seed`, so
/// deliveries arrive out of chain order.
#[derive(Clone)]
struct ShuffledNetwork {
    blocks: Arc<RwLock<HashMap<Bytes32, Block>>>,
    seed: u8,
}

impl ShuffledNetwork {
    fn new(blocks: &[Block], seed: u8) -> Self {
        let network = Self {
            blocks: Arc::new(RwLock::new(HashMap::new())),
            seed,
        };
        network.add(blocks);
        network
    }

    fn add(&self, blocks: &[Block]) {
        let mut known = self.blocks.write();
        for block in blocks {
            known.insert(block.hash(), block.clone());
        }
    }
}

#[async_trait::async_trait]
impl BlockFetcher for ShuffledNetwork {
    async fn fetch_block(&self, _peer_id: PeerId, hash: Bytes32) -> Option<Block> {
        let delay = (hash.0[0] ^ self.seed) % 8;
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        self.blocks.read().get(&hash).cloned()
    }
}

fn fast_config() -> StoreConfig {
    StoreConfig {
        idle_interval: Duration::from_millis(5),
        download_poll_interval: Duration::from_millis(1),
        ..StoreConfig::default()
    }
}

fn new_loop(
    repository: Arc<dyn BlockRepository>,
    chain: Arc<HeaderChain>,
    network: ShuffledNetwork,
) -> BlockStoreLoop<ShuffledNetwork> {
    let mut puller = BlockPuller::new(network, PullerConfig::default());
    puller.add_peer(PeerId::random(), None);
    puller.add_peer(PeerId::random(), None);
    BlockStoreLoop::new(
        repository,
        chain,
        Arc::new(ChainState::new(false)),
        puller,
        fast_config(),
    )
    .unwrap()
}

async fn wait_for_tip(repository: &dyn BlockRepository, tip: ChainPosition) {
    for _ in 0..500 {
        if repository.tip() == tip {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("repository tip never reached height {}", tip.height);
}

#[tokio::test]
async fn test_run_syncs_to_best_chain_tip() {
    let blocks = chain_of(120);
    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
    let store = new_loop(
        Arc::clone(&repository),
        header_chain(&blocks),
        ShuffledNetwork::new(&blocks, 3),
    );
    let handle = store.handle();
    let mut events = handle.subscribe();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(store.run(shutdown.clone()));

    wait_for_tip(repository.as_ref(), blocks[120].position()).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    for block in &blocks {
        assert_eq!(repository.get(&block.hash()).unwrap().as_ref(), Some(block));
    }
    let mut last_height = Height::GENESIS;
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::TipAdvanced { tip, .. } = event {
            assert!(tip.height > last_height);
            last_height = tip.height;
        }
    }
    assert_eq!(last_height, Height(120));
    assert_eq!(handle.status().phase, LoopPhase::Stopped);
}

#[tokio::test]
async fn test_final_state_independent_of_delivery_order() {
    let blocks = chain_of(60);
    let mut tips = Vec::new();
    for seed in [0, 0x5a, 0xff] {
        let repository: Arc<dyn BlockRepository> =
            Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
        let store = new_loop(
            Arc::clone(&repository),
            header_chain(&blocks),
            ShuffledNetwork::new(&blocks, seed),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(store.run(shutdown.clone()));
        wait_for_tip(repository.as_ref(), blocks[60].position()).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let canonical: Vec<Option<Bytes32>> = (0..=60)
            .map(|height| repository.hash_at(Height(height)).unwrap())
            .collect();
        tips.push(canonical);
    }

    assert_eq!(tips[0], tips[1]);
    assert_eq!(tips[1], tips[2]);
}

#[tokio::test]
async fn test_follows_best_chain_reorg_while_running() {
    let main = chain_of(30);
    let fork = extend(&main[20], 15, 7);
    let chain = header_chain(&main);
    let network = ShuffledNetwork::new(&main, 1);
    network.add(&fork);

    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(main[0].clone()));
    let store = new_loop(Arc::clone(&repository), Arc::clone(&chain), network);
    let mut events = store.handle().subscribe();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(store.run(shutdown.clone()));

    wait_for_tip(repository.as_ref(), main[30].position()).await;
    chain.apply_branch(&positions(&fork)).unwrap();
    wait_for_tip(repository.as_ref(), fork[14].position()).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert!(!repository.exists(&main[21].hash()).unwrap());
    assert_eq!(repository.hash_at(Height(20)).unwrap(), Some(main[20].hash()));
    let mut rewound = None;
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::TipRewound { from, to } = event {
            rewound = Some((from, to));
        }
    }
    assert_eq!(rewound, Some((main[30].position(), main[20].position())));
}

#[tokio::test]
async fn test_construction_rewinds_stale_tip_on_disk() {
    let main = chain_of(12);
    let dir = tempfile::tempdir().unwrap();
    {
        let repository = FjallBlockRepository::open(dir.path(), &main[0], false).unwrap();
        let batch: Vec<_> = main[1..]
            .iter()
            .cloned()
            .map(containers::PendingBlock::from_block)
            .collect();
        repository.put_batch(&batch).unwrap();
    }

    // The best chain moved to another branch while the node was down.
    let mut best = main[..=9].to_vec();
    best.extend(extend(&main[9], 4, 2));
    let repository: Arc<dyn BlockRepository> =
        Arc::new(FjallBlockRepository::open(dir.path(), &main[0], false).unwrap());
    let store = new_loop(
        Arc::clone(&repository),
        header_chain(&best),
        ShuffledNetwork::new(&best, 0),
    );

    assert_eq!(repository.tip(), main[9].position());
    assert!(!repository.exists(&main[10].hash()).unwrap());
    assert_eq!(store.status().tip_height, Height(9));
}

#[tokio::test]
async fn test_handle_direct_insert() {
    let blocks = chain_of(5);
    let stray = extend(&blocks[2], 1, 9).remove(0);
    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
    repository
        .put_batch(&[containers::PendingBlock::from_block(blocks[1].clone())])
        .unwrap();
    let store = new_loop(
        Arc::clone(&repository),
        header_chain(&blocks),
        ShuffledNetwork::new(&[], 0),
    );
    let handle = store.handle();

    let block = blocks[3].clone();
    assert!(handle.add_to_pending(block.hash(), block.clone(), block.position()));
    assert!(!handle.add_to_pending(block.hash(), block.clone(), block.position()));
    assert_eq!(handle.get_pending(&block.hash()).unwrap().block, block);
    assert_eq!(store.get_pending(&block.hash()).unwrap().block, block);

    // Off the best chain, at or below the tip, or mislabelled.
    assert!(!handle.add_to_pending(stray.hash(), stray.clone(), stray.position()));
    assert!(!handle.add_to_pending(blocks[1].hash(), blocks[1].clone(), blocks[1].position()));
    assert!(!handle.add_to_pending(blocks[4].hash(), blocks[4].clone(), blocks[3].position()));
    assert!(handle.get_pending(&stray.hash()).is_none());
    assert_eq!(handle.repository().tip(), blocks[1].position());
}

#[tokio::test]
async fn test_direct_insert_is_flushed_without_download() {
    let blocks = chain_of(3);
    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
    let mut store = new_loop(
        Arc::clone(&repository),
        header_chain(&blocks),
        ShuffledNetwork::new(&[], 0),
    );
    let handle = store.handle();
    for block in &blocks[1..] {
        assert!(handle.add_to_pending(block.hash(), block.clone(), block.position()));
    }

    assert_eq!(store.tick().unwrap(), StepResult::Continue);

    assert_eq!(repository.tip(), blocks[3].position());
    assert_eq!(store.puller().in_flight(), 0);
    let status = handle.status();
    assert_eq!(status.tip_height, Height(3));
    assert_eq!(status.pending, 0);
    assert_eq!(status.phase, LoopPhase::Syncing);
}

#[tokio::test]
async fn test_run_stops_on_cancelled_token_and_abandons_requests() {
    let blocks = chain_of(5);
    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
    // Peers know nothing, so requests stay in flight until they time out.
    let store = new_loop(
        Arc::clone(&repository),
        header_chain(&blocks),
        ShuffledNetwork::new(&[], 0),
    );
    let handle = store.handle();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    store.run(shutdown).await.unwrap();

    assert_eq!(handle.status().phase, LoopPhase::Stopped);
    assert_eq!(handle.status().in_flight, 0);
    assert_eq!(repository.tip(), blocks[0].position());
}

#[tokio::test]
async fn test_chain_indexer_view_is_shared() {
    let blocks = chain_of(2);
    let chain = header_chain(&blocks[..2]);
    let repository: Arc<dyn BlockRepository> = Arc::new(MemoryBlockRepository::new(blocks[0].clone()));
    let mut store = new_loop(Arc::clone(&repository), Arc::clone(&chain), ShuffledNetwork::new(&blocks, 0));

    chain.push(blocks[2].position()).unwrap();
    store.tick().unwrap();

    assert_eq!(store.status().chain_tip_height, chain.tip().height);
}
