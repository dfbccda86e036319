//! Best-chain view consumed by the block store.
//!
//! The header chain is maintained by the consensus side of the node. The
//! block store only reads it through [`ChainIndexer`] and reads the
//! initial-block-download flag through [`ChainState`].

pub mod chain_state;
pub mod config;
pub mod header_chain;
pub mod indexer;

pub use chain_state::ChainState;
pub use header_chain::{ChainError, HeaderChain};
pub use indexer::ChainIndexer;
