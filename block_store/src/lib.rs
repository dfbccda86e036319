//! Block store synchronization engine.
//!
//! Keeps a durable, ordered copy of the block chain in step with the node's
//! best-chain view while blocks arrive out of order and the best chain can
//! be reorganized.
//!
//! - **Repository**: hash-addressed block storage plus the persisted tip
//! - **Pending Storage**: blocks received but not yet written
//! - **Steps**: reorganize, catch up from the buffer, download, idle
//! - **Block Store Loop**: drives one step per tick and owns the buffer and
//!   the puller

pub mod config;
pub mod error;
pub mod pending;
pub mod repository;
pub mod steps;
pub mod store_loop;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use pending::{PendingStorage, RunSummary};
pub use repository::{BlockRepository, FjallBlockRepository, MemoryBlockRepository};
pub use steps::{StepResult, SyncStep};
pub use store_loop::{BlockStoreHandle, BlockStoreLoop, LoopPhase, LoopStatus, StoreEvent};

#[cfg(test)]
mod tests;
