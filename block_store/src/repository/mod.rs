//! Durable block storage.
//!
//! A repository maps block hashes to blocks and records the tip: the highest
//! block whose whole ancestry down to genesis is stored. Two backends share
//! the same contract:
//!
//! - [`MemoryBlockRepository`] for tests and ephemeral nodes
//! - [`FjallBlockRepository`] for on-disk storage

mod fjall;
mod memory;

use containers::{Block, Bytes32, ChainPosition, Height, PendingBlock};

use crate::error::{Result, StoreError};

pub use self::fjall::FjallBlockRepository;
pub use memory::MemoryBlockRepository;

/// Hash-addressed block storage with a single canonical tip.
///
/// Writers are serialized by the implementation. Readers may run
/// concurrently with a writer and see either the old or the new state.
pub trait BlockRepository: Send + Sync {
    fn get(&self, hash: &Bytes32) -> Result<Option<Block>>;

    fn exists(&self, hash: &Bytes32) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Hash of the block at `height` on the tip's ancestry.
    fn hash_at(&self, height: Height) -> Result<Option<Bytes32>>;

    fn tip(&self) -> ChainPosition;

    /// Atomically append `batch` on top of the tip and advance the tip to
    /// its last block.
    ///
    /// A prefix that is already stored on the tip's ancestry is skipped, so
    /// re-submitting a persisted batch is a no-op. Anything else that does
    /// not extend the tip fails with `OutOfOrderBlock` and leaves the
    /// repository unchanged.
    fn put_batch(&self, batch: &[PendingBlock]) -> Result<ChainPosition>;

    /// Rewind the tip to `tip`, which must be a stored ancestor of the
    /// current tip. Blocks above it are removed in the same atomic write.
    fn set_tip(&self, tip: ChainPosition) -> Result<()>;
}

/// What a backend must write for a `put_batch` call.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BatchPlan<'a> {
    AlreadyStored,
    Append(&'a [PendingBlock]),
}

/// Validate `batch` against `tip` and find the part that still has to be
/// written. `hash_at` reads the backend's canonical height index.
pub(crate) fn plan_batch<'a, H>(
    tip: &ChainPosition,
    batch: &'a [PendingBlock],
    mut hash_at: H,
) -> Result<BatchPlan<'a>>
where
    H: FnMut(Height) -> Result<Option<Bytes32>>,
{
    for pending in batch {
        if pending.block.hash() != pending.position.hash {
            return Err(StoreError::PositionMismatch(pending.position.hash));
        }
    }
    for pair in batch.windows(2) {
        if !pair[1].position.extends(&pair[0].position) {
            return Err(StoreError::OutOfOrderBlock {
                expected: pair[0].hash(),
                found: pair[1].position.prev_hash,
            });
        }
    }

    let mut stored = 0;
    for pending in batch {
        if pending.height() > tip.height || hash_at(pending.height())? != Some(pending.hash()) {
            break;
        }
        stored += 1;
    }

    let rest = &batch[stored..];
    let Some(first) = rest.first() else {
        return Ok(BatchPlan::AlreadyStored);
    };
    if !first.position.extends(tip) {
        return Err(StoreError::OutOfOrderBlock {
            expected: tip.hash,
            found: first.position.prev_hash,
        });
    }
    Ok(BatchPlan::Append(rest))
}

/// Check that `target` is a stored ancestor of (or equal to) `tip`.
pub(crate) fn check_rewind_target<H>(
    tip: &ChainPosition,
    target: &ChainPosition,
    mut hash_at: H,
) -> Result<()>
where
    H: FnMut(Height) -> Result<Option<Bytes32>>,
{
    if target.height > tip.height || hash_at(target.height)? != Some(target.hash) {
        return Err(StoreError::InvalidTip(target.hash));
    }
    Ok(())
}
