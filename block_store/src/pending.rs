use std::collections::{HashMap, HashSet};

use containers::{Bytes32, ChainPosition, Height, PendingBlock};

/// Size of the contiguous run that extends a given tip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub blocks: usize,
    pub bytes: usize,
    pub last: Option<ChainPosition>,
}

/// Blocks received from the network but not yet written to the repository.
///
/// Entries are keyed by hash, with a parent index so the run extending the
/// repository tip can be found without scanning. The caps are soft: a
/// buffer at or over either cap reports full and rejects `try_add`.
#[derive(Debug)]
pub struct PendingStorage {
    blocks: HashMap<Bytes32, PendingBlock>,
    children: HashMap<Bytes32, HashSet<Bytes32>>,
    size_bytes: usize,
    max_blocks: usize,
    max_bytes: usize,
}

impl PendingStorage {
    pub fn new(max_blocks: usize, max_bytes: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            children: HashMap::new(),
            size_bytes: 0,
            max_blocks,
            max_bytes,
        }
    }

    /// Insert `pending` under `hash`. Returns false if the hash is already
    /// buffered or the buffer is full.
    pub fn try_add(&mut self, hash: Bytes32, pending: PendingBlock) -> bool {
        if self.is_full() {
            return false;
        }
        self.force_add(hash, pending)
    }

    /// Insert regardless of the caps. Only for blocks whose room was
    /// reserved when they were requested, or that unblock the next flush.
    pub fn force_add(&mut self, hash: Bytes32, pending: PendingBlock) -> bool {
        if self.blocks.contains_key(&hash) {
            return false;
        }
        self.size_bytes += pending.size_bytes();
        self.children
            .entry(pending.position.prev_hash)
            .or_default()
            .insert(hash);
        self.blocks.insert(hash, pending);
        true
    }

    pub fn try_remove(&mut self, hash: &Bytes32) -> Option<PendingBlock> {
        let pending = self.blocks.remove(hash)?;
        self.size_bytes -= pending.size_bytes();
        let parent = pending.position.prev_hash;
        if let Some(siblings) = self.children.get_mut(&parent) {
            siblings.remove(hash);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
        Some(pending)
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &Bytes32) -> Option<&PendingBlock> {
        self.blocks.get(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.max_blocks || self.size_bytes >= self.max_bytes
    }

    /// Free block slots before the count cap is reached.
    pub fn free_slots(&self) -> usize {
        self.max_blocks.saturating_sub(self.blocks.len())
    }

    /// The single buffered block building on `parent`, if exactly one does.
    fn only_child(&self, parent: &ChainPosition) -> Option<&PendingBlock> {
        let children = self.children.get(&parent.hash)?;
        if children.len() != 1 {
            return None;
        }
        let hash = children.iter().next()?;
        self.blocks
            .get(hash)
            .filter(|pending| pending.position.extends(parent))
    }

    /// Measure the run starting right after `tip` without removing it.
    ///
    /// The run ends at the first gap or at a fork.
    pub fn peek_contiguous_run(&self, tip: &ChainPosition) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut parent = *tip;
        while let Some(next) = self.only_child(&parent) {
            summary.blocks += 1;
            summary.bytes += next.size_bytes();
            summary.last = Some(next.position);
            parent = next.position;
        }
        summary
    }

    /// Remove and return the run starting right after `tip`, in height
    /// order, bounded by `max_blocks` and `max_bytes`. The first block is
    /// always taken even if it alone exceeds `max_bytes`.
    pub fn take_contiguous_run(
        &mut self,
        tip: &ChainPosition,
        max_blocks: usize,
        max_bytes: usize,
    ) -> Vec<PendingBlock> {
        let mut hashes = Vec::new();
        let mut bytes = 0;
        let mut parent = *tip;
        while hashes.len() < max_blocks {
            let Some(next) = self.only_child(&parent) else {
                break;
            };
            if !hashes.is_empty() && bytes + next.size_bytes() > max_bytes {
                break;
            }
            bytes += next.size_bytes();
            hashes.push(next.hash());
            parent = next.position;
        }

        hashes
            .iter()
            .filter_map(|hash| self.try_remove(hash))
            .collect()
    }

    /// Keep only entries `keep` accepts. Returns the removed entries.
    pub fn retain<P>(&mut self, mut keep: P) -> Vec<PendingBlock>
    where
        P: FnMut(&PendingBlock) -> bool,
    {
        let doomed: Vec<Bytes32> = self
            .blocks
            .values()
            .filter(|pending| !keep(pending))
            .map(PendingBlock::hash)
            .collect();
        doomed
            .iter()
            .filter_map(|hash| self.try_remove(hash))
            .collect()
    }

    /// True if any entry fails `keep`.
    pub fn any_rejected<P>(&self, mut keep: P) -> bool
    where
        P: FnMut(&PendingBlock) -> bool,
    {
        self.blocks.values().any(|pending| !keep(pending))
    }

    /// Drop entries at or below `height`; they can no longer be written.
    pub fn prune_at_or_below(&mut self, height: Height) -> usize {
        self.retain(|pending| pending.height() > height).len()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.children.clear();
        self.size_bytes = 0;
    }
}
