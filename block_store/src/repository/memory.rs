use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use containers::{Block, Bytes32, ChainPosition, Height, PendingBlock};
use parking_lot::RwLock;
use tracing::debug;

use super::{check_rewind_target, plan_batch, BatchPlan, BlockRepository};
use crate::error::{Result, StoreError};

/// Repository kept entirely in memory.
pub struct MemoryBlockRepository {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
}

struct Inner {
    blocks: HashMap<Bytes32, Block>,
    // Index is the height.
    canonical: Vec<Bytes32>,
    tip: ChainPosition,
}

impl Inner {
    fn hash_at(&self, height: Height) -> Option<Bytes32> {
        self.canonical.get(height.0 as usize).copied()
    }
}

impl MemoryBlockRepository {
    pub fn new(genesis: Block) -> Self {
        let tip = genesis.position();
        let mut blocks = HashMap::new();
        blocks.insert(tip.hash, genesis);
        Self {
            inner: RwLock::new(Inner {
                blocks,
                canonical: vec![tip.hash],
                tip,
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail with `RepositoryIo`, leaving the
    /// stored state untouched.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::RepositoryIo("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl BlockRepository for MemoryBlockRepository {
    fn get(&self, hash: &Bytes32) -> Result<Option<Block>> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn exists(&self, hash: &Bytes32) -> Result<bool> {
        Ok(self.inner.read().blocks.contains_key(hash))
    }

    fn hash_at(&self, height: Height) -> Result<Option<Bytes32>> {
        Ok(self.inner.read().hash_at(height))
    }

    fn tip(&self) -> ChainPosition {
        self.inner.read().tip
    }

    fn put_batch(&self, batch: &[PendingBlock]) -> Result<ChainPosition> {
        let mut inner = self.inner.write();
        let tip = inner.tip;
        let rest = match plan_batch(&tip, batch, |height| Ok(inner.hash_at(height)))? {
            BatchPlan::AlreadyStored => return Ok(tip),
            BatchPlan::Append(rest) => rest,
        };
        self.check_writable()?;

        for pending in rest {
            inner.blocks.insert(pending.hash(), pending.block.clone());
            inner.canonical.push(pending.hash());
        }
        inner.tip = rest[rest.len() - 1].position;
        debug!(tip = inner.tip.height.0, blocks = rest.len(), "Appended batch");
        Ok(inner.tip)
    }

    fn set_tip(&self, tip: ChainPosition) -> Result<()> {
        let mut inner = self.inner.write();
        let current = inner.tip;
        check_rewind_target(&current, &tip, |height| Ok(inner.hash_at(height)))?;
        if tip == current {
            return Ok(());
        }
        self.check_writable()?;

        let keep = tip.height.0 as usize + 1;
        let removed: Vec<Bytes32> = inner.canonical.drain(keep..).collect();
        for hash in &removed {
            inner.blocks.remove(hash);
        }
        inner.tip = tip;
        debug!(tip = tip.height.0, removed = removed.len(), "Rewound tip");
        Ok(())
    }
}
