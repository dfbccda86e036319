pub mod types;
pub mod config;
pub mod height;
pub mod block;
pub mod position;

pub use block::{Block, BlockHeader, Transaction};
pub use config::GenesisConfig;
pub use height::Height;
pub use position::{ChainPosition, PendingBlock};
pub use types::Bytes32;
