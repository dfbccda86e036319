use crate::{Bytes32, ChainPosition, Height};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed overhead counted for every block in byte budgets: the encoded
/// header plus a length prefix for the transaction list.
pub const BLOCK_HEADER_SIZE: usize = 8 + 32 + 32 + 8 + 4;

/// Opaque transaction payload. Validation is someone else's job; the block
/// store only moves bytes around.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transaction(#[serde(with = "hex::serde")] pub Vec<u8>);

impl Transaction {
    pub fn hash(&self) -> Bytes32 {
        Bytes32(Sha256::digest(&self.0).into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub height: Height,
    pub parent_hash: Bytes32,
    pub body_root: Bytes32,
    pub timestamp: u64,
}

impl BlockHeader {
    /// Block hash: SHA-256 over height, parent hash, body root and timestamp
    /// in that order, integers big-endian.
    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.body_root.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        Bytes32(hasher.finalize().into())
    }

    pub fn position(&self) -> ChainPosition {
        ChainPosition::new(self.hash(), self.height, self.parent_hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Build a block on top of `parent`, computing the body root.
    pub fn new(
        height: Height,
        parent_hash: Bytes32,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        let header = BlockHeader {
            height,
            parent_hash,
            body_root: compute_body_root(&transactions),
            timestamp,
        };
        Self { header, transactions }
    }

    pub fn hash(&self) -> Bytes32 {
        self.header.hash()
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn parent_hash(&self) -> Bytes32 {
        self.header.parent_hash
    }

    pub fn position(&self) -> ChainPosition {
        self.header.position()
    }

    /// Estimated encoded size, used for pending-buffer and batch budgets.
    pub fn size_bytes(&self) -> usize {
        BLOCK_HEADER_SIZE
            + self
                .transactions
                .iter()
                .map(|tx| tx.0.len() + 4)
                .sum::<usize>()
    }

    /// True when the header commits to the carried transactions.
    pub fn body_matches_header(&self) -> bool {
        compute_body_root(&self.transactions) == self.header.body_root
    }
}

/// Root over the transaction list: SHA-256 of the concatenated transaction
/// hashes. An empty body has the zero root.
pub fn compute_body_root(transactions: &[Transaction]) -> Bytes32 {
    if transactions.is_empty() {
        return Bytes32::zero();
    }

    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(tx.hash().as_bytes());
    }
    Bytes32(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(bytes: &[u8]) -> Transaction {
        Transaction(bytes.to_vec())
    }

    #[test]
    fn test_hash_changes_with_parent() {
        let a = Block::new(Height(1), Bytes32([1; 32]), 0, vec![]);
        let b = Block::new(Height(1), Bytes32([2; 32]), 0, vec![]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_body_root_commits_to_transactions() {
        let mut block = Block::new(Height(3), Bytes32::zero(), 7, vec![tx(b"a"), tx(b"b")]);
        assert!(block.body_matches_header());

        block.transactions.push(tx(b"c"));
        assert!(!block.body_matches_header());
    }

    #[test]
    fn test_empty_body_has_zero_root() {
        let block = Block::new(Height(0), Bytes32::zero(), 0, vec![]);
        assert!(block.header.body_root.is_zero());
    }

    #[test]
    fn test_size_counts_transactions() {
        let empty = Block::new(Height(1), Bytes32::zero(), 0, vec![]);
        let full = Block::new(Height(1), Bytes32::zero(), 0, vec![tx(&[0u8; 100])]);
        assert_eq!(empty.size_bytes(), BLOCK_HEADER_SIZE);
        assert_eq!(full.size_bytes(), BLOCK_HEADER_SIZE + 104);
    }

    #[test]
    fn test_position_links_to_parent() {
        let parent = Block::new(Height(4), Bytes32::zero(), 0, vec![]);
        let child = Block::new(Height(5), parent.hash(), 1, vec![]);
        let position = child.position();
        assert_eq!(position.prev_hash, parent.hash());
        assert_eq!(position.height, Height(5));
        assert_eq!(position.hash, child.hash());
    }

    #[test]
    fn test_json_round_trip_keeps_hash() {
        let block = Block::new(Height(9), Bytes32([4; 32]), 1234, vec![tx(b"payload")]);
        let json = serde_json::to_vec(&block).unwrap();
        let decoded: Block = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.hash(), block.hash());
    }
}
