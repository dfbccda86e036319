use crate::{Block, Bytes32, Height};
use serde::{Deserialize, Serialize};

/// A block's place in the header chain: its hash, height and the hash of the
/// block it builds on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPosition {
    pub hash: Bytes32,
    pub height: Height,
    pub prev_hash: Bytes32,
}

impl ChainPosition {
    pub fn new(hash: Bytes32, height: Height, prev_hash: Bytes32) -> Self {
        Self {
            hash,
            height,
            prev_hash,
        }
    }

    /// True when `self` directly extends `parent`.
    pub fn extends(&self, parent: &ChainPosition) -> bool {
        self.prev_hash == parent.hash && self.height == parent.height.next()
    }
}

/// A block received from the network but not yet written to the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBlock {
    pub block: Block,
    pub position: ChainPosition,
}

impl PendingBlock {
    pub fn new(block: Block, position: ChainPosition) -> Self {
        Self { block, position }
    }

    /// Build from a block, deriving the position from its header.
    pub fn from_block(block: Block) -> Self {
        let position = block.position();
        Self { block, position }
    }

    pub fn hash(&self) -> Bytes32 {
        self.position.hash
    }

    pub fn height(&self) -> Height {
        self.position.height
    }

    pub fn size_bytes(&self) -> usize {
        self.block.size_bytes()
    }
}
