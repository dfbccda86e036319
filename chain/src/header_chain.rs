use std::collections::HashMap;

use containers::{Bytes32, ChainPosition, Height};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::ChainIndexer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("branch is empty")]
    EmptyBranch,
    #[error("parent {0:?} of branch is not on the active chain")]
    UnknownParent(Bytes32),
    #[error("header at height {height} does not extend its predecessor")]
    NotLinked { height: Height },
    #[error("genesis cannot be replaced")]
    GenesisReplaced,
}

/// In-memory best chain of headers.
///
/// Holds only the active chain: one position per height plus a hash index.
/// Adopting a branch truncates everything above the fork point.
#[derive(Debug)]
pub struct HeaderChain {
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    by_height: Vec<ChainPosition>,
    by_hash: HashMap<Bytes32, Height>,
}

impl Inner {
    fn truncate_above(&mut self, height: Height) {
        let keep = height.0 as usize + 1;
        for removed in self.by_height.drain(keep.min(self.by_height.len())..) {
            self.by_hash.remove(&removed.hash);
        }
    }

    fn push(&mut self, position: ChainPosition) {
        self.by_hash.insert(position.hash, position.height);
        self.by_height.push(position);
    }

    fn tip(&self) -> ChainPosition {
        // Never empty: genesis is inserted at construction and cannot be removed.
        self.by_height[self.by_height.len() - 1]
    }
}

impl HeaderChain {
    pub fn new(genesis: ChainPosition) -> Self {
        let mut inner = Inner {
            by_height: Vec::new(),
            by_hash: HashMap::new(),
        };
        inner.push(genesis);
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Extend the chain by one header on top of the current tip.
    pub fn push(&self, position: ChainPosition) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        if !position.extends(&inner.tip()) {
            return Err(ChainError::NotLinked {
                height: position.height,
            });
        }
        inner.push(position);
        Ok(())
    }

    /// Adopt `branch` as the active chain above its first header's parent.
    ///
    /// Returns the height of the fork point (the parent of the first header).
    pub fn apply_branch(&self, branch: &[ChainPosition]) -> Result<Height, ChainError> {
        let first = branch.first().ok_or(ChainError::EmptyBranch)?;
        if first.height == Height::GENESIS {
            return Err(ChainError::GenesisReplaced);
        }
        for pair in branch.windows(2) {
            if !pair[1].extends(&pair[0]) {
                return Err(ChainError::NotLinked {
                    height: pair[1].height,
                });
            }
        }

        let mut inner = self.inner.write();
        let fork_height = match inner.by_hash.get(&first.prev_hash) {
            Some(height) if height.next() == first.height => *height,
            _ => return Err(ChainError::UnknownParent(first.prev_hash)),
        };

        let old_tip = inner.tip();
        inner.truncate_above(fork_height);
        for position in branch {
            inner.push(*position);
        }

        let new_tip = inner.tip();
        if old_tip.height > fork_height {
            info!(
                fork_height = fork_height.0,
                old_tip = old_tip.height.0,
                new_tip = new_tip.height.0,
                "Best chain reorganized"
            );
        } else {
            debug!(tip = new_tip.height.0, "Best chain extended");
        }

        Ok(fork_height)
    }

    pub fn height(&self) -> Height {
        self.inner.read().tip().height
    }

    pub fn genesis(&self) -> ChainPosition {
        self.inner.read().by_height[0]
    }
}

impl ChainIndexer for HeaderChain {
    fn tip(&self) -> ChainPosition {
        self.inner.read().tip()
    }

    fn get_header_at(&self, height: Height) -> Option<ChainPosition> {
        self.inner.read().by_height.get(height.0 as usize).copied()
    }

    fn get_header_by_hash(&self, hash: &Bytes32) -> Option<ChainPosition> {
        let inner = self.inner.read();
        inner
            .by_hash
            .get(hash)
            .and_then(|height| inner.by_height.get(height.0 as usize).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hash(tag: u8, height: u64) -> Bytes32 {
        let mut bytes = [tag; 32];
        bytes[..8].copy_from_slice(&height.to_be_bytes());
        Bytes32(bytes)
    }

    fn branch(tag: u8, parent: ChainPosition, len: u64) -> Vec<ChainPosition> {
        let mut out = Vec::new();
        let mut prev = parent;
        for i in 1..=len {
            let height = Height(parent.height.0 + i);
            let position = ChainPosition::new(hash(tag, height.0), height, prev.hash);
            out.push(position);
            prev = position;
        }
        out
    }

    fn genesis() -> ChainPosition {
        ChainPosition::new(hash(0, 0), Height(0), Bytes32::zero())
    }

    #[test]
    fn test_push_and_lookup() {
        let chain = HeaderChain::new(genesis());
        for position in branch(1, genesis(), 3) {
            chain.push(position).unwrap();
        }

        assert_eq!(chain.height(), Height(3));
        let at_two = chain.get_header_at(Height(2)).unwrap();
        assert_eq!(chain.get_header_by_hash(&at_two.hash), Some(at_two));
        assert!(chain.contains(&at_two));
    }

    #[test]
    fn test_push_rejects_unlinked_header() {
        let chain = HeaderChain::new(genesis());
        let stray = ChainPosition::new(hash(9, 1), Height(1), hash(9, 0));
        assert_eq!(
            chain.push(stray),
            Err(ChainError::NotLinked { height: Height(1) })
        );
    }

    #[test]
    fn test_apply_branch_replaces_fork() {
        let chain = HeaderChain::new(genesis());
        let main = branch(1, genesis(), 5);
        chain.apply_branch(&main).unwrap();

        let fork = branch(2, main[1], 4);
        let fork_height = chain.apply_branch(&fork).unwrap();

        assert_eq!(fork_height, Height(2));
        assert_eq!(chain.height(), Height(6));
        assert_eq!(chain.get_header_at(Height(3)), Some(fork[0]));
        assert_eq!(chain.get_header_by_hash(&main[3].hash), None);
        assert!(!chain.contains(&main[4]));
        assert!(chain.contains(&main[1]));
    }

    #[test]
    fn test_apply_branch_unknown_parent() {
        let chain = HeaderChain::new(genesis());
        let orphan = ChainPosition::new(hash(3, 5), Height(5), hash(3, 4));
        assert_eq!(
            chain.apply_branch(&[orphan]),
            Err(ChainError::UnknownParent(hash(3, 4)))
        );
    }
}
