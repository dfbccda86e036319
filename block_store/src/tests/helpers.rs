use chain::HeaderChain;
use containers::{Block, Bytes32, Height, PendingBlock, Transaction};

pub(crate) fn genesis() -> Block {
    Block::new(Height::GENESIS, Bytes32::zero(), 0, vec![])
}

/// `len` blocks on top of `parent`. Different `salt`s give different
/// branches from the same parent.
pub(crate) fn extend(parent: &Block, len: u64, salt: u8) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut parent = parent.position();
    for _ in 0..len {
        let height = parent.height.next();
        let block = Block::new(
            height,
            parent.hash,
            height.0 * 12,
            vec![Transaction(vec![salt; 16])],
        );
        parent = block.position();
        blocks.push(block);
    }
    blocks
}

/// Genesis followed by `len` blocks; index equals height.
pub(crate) fn chain_of(len: u64) -> Vec<Block> {
    let genesis = genesis();
    let mut blocks = vec![genesis.clone()];
    blocks.extend(extend(&genesis, len, 0));
    blocks
}

pub(crate) fn pending(blocks: &[Block]) -> Vec<PendingBlock> {
    blocks.iter().cloned().map(PendingBlock::from_block).collect()
}

/// Header chain over `blocks`, which must start at genesis.
pub(crate) fn header_chain(blocks: &[Block]) -> HeaderChain {
    let chain = HeaderChain::new(blocks[0].position());
    for block in &blocks[1..] {
        chain.push(block.position()).unwrap();
    }
    chain
}
