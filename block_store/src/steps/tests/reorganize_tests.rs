use containers::{Block, Height};
use pretty_assertions::assert_eq;

use super::{Harness, MockFetcher};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::repository::BlockRepository;
use crate::steps::{rewind_to_best_chain, StepResult, SyncStep};
use crate::store_loop::StoreEvent;
use crate::tests::helpers::{chain_of, extend};

/// Best chain that shares `main` up to `fork_parent` and then follows a
/// different branch of `len` blocks.
fn forked(main: &[Block], fork_parent: usize, len: u64) -> Vec<Block> {
    let mut best = main[..=fork_parent].to_vec();
    best.extend(extend(&main[fork_parent], len, 1));
    best
}

#[tokio::test]
async fn test_tip_rewound_to_common_ancestor() {
    let main = chain_of(50);
    let best = forked(&main, 47, 5);
    let mut harness = Harness::new(&main, &best, MockFetcher::hanging(), StoreConfig::default());
    harness.puller.add_peer(networking::PeerId::random(), None);
    let mut events = harness.events.subscribe();

    let outcome = harness.tick().unwrap();

    assert_eq!(outcome.step, Some(SyncStep::Reorganize));
    assert_eq!(outcome.result, StepResult::Continue);
    assert_eq!(harness.repository.tip(), main[47].position());
    assert!(!harness.repository.exists(&main[48].hash()).unwrap());
    assert_eq!(harness.puller.in_flight(), 0);
    assert_eq!(
        events.try_recv().unwrap(),
        StoreEvent::TipRewound {
            from: main[50].position(),
            to: main[47].position(),
        }
    );

    // Downloading starts from the new branch only afterwards.
    let outcome = harness.tick().unwrap();
    assert_eq!(outcome.step, Some(SyncStep::Download));
    assert!(harness.puller.is_requested(&best[48].hash()));
    assert!(!harness.puller.is_requested(&main[48].hash()));
}

#[test]
fn test_tip_on_best_chain_is_left_alone() {
    let blocks = chain_of(5);
    let harness = Harness::new(&blocks, &blocks, MockFetcher::default(), StoreConfig::default());

    let rewind = rewind_to_best_chain(&harness.repository, &harness.chain, 10).unwrap();
    assert_eq!(rewind, None);
    assert_eq!(harness.repository.tip(), blocks[5].position());
}

#[test]
fn test_tip_ahead_of_best_chain_is_rewound() {
    let blocks = chain_of(5);
    let mut harness = Harness::new(&blocks, &blocks[..4], MockFetcher::default(), StoreConfig::default());

    let outcome = harness.tick().unwrap();

    assert_eq!(outcome.step, Some(SyncStep::Reorganize));
    assert_eq!(harness.repository.tip(), blocks[3].position());
}

#[test]
fn test_reorg_deeper_than_limit_fails() {
    let main = chain_of(10);
    let best = forked(&main, 5, 6);
    let config = StoreConfig {
        max_reorg_depth: 3,
        ..StoreConfig::default()
    };
    let mut harness = Harness::new(&main, &best, MockFetcher::default(), config);

    let err = harness.tick().unwrap_err();

    assert!(matches!(err, StoreError::ReorgDepthExceeded { depth: 3, max: 3 }));
    assert_eq!(harness.repository.tip(), main[10].position());
}

#[test]
fn test_stale_pending_entries_are_discarded() {
    let main = chain_of(6);
    let best = forked(&main, 2, 4);
    let mut harness = Harness::new(&main[..3], &best, MockFetcher::default(), StoreConfig::default());
    harness.add_pending(&main[4..]);
    harness.add_pending(&best[4..5]);
    let mut events = harness.events.subscribe();

    let outcome = harness.tick().unwrap();

    assert_eq!(outcome.step, Some(SyncStep::Reorganize));
    assert_eq!(harness.repository.tip(), main[2].position());
    let pending = harness.pending.lock();
    assert_eq!(pending.len(), 1);
    assert!(pending.contains(&best[4].hash()));
    assert!(events.try_recv().is_err());
    drop(pending);

    // Nothing left to reconcile.
    let outcome = harness.tick().unwrap();
    assert_ne!(outcome.step, Some(SyncStep::Reorganize));
    assert_eq!(harness.repository.hash_at(Height(2)).unwrap(), Some(best[2].hash()));
}
