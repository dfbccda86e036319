/// Block store configuration constants.
///
/// Buffer budgets, batch sizes and pacing for the synchronization loop.
use std::time::Duration;

use networking::puller::config::duration_millis;
use serde::Deserialize;

/// Maximum number of blocks held in pending storage.
pub const MAX_PENDING_BLOCKS: usize = 2_000;

/// Maximum total size of blocks held in pending storage.
pub const MAX_PENDING_BYTES: usize = 128 * 1024 * 1024;

/// Blocks requested per tick during initial block download.
pub const IBD_DOWNLOAD_BATCH: usize = 500;

/// Blocks requested per tick once caught up.
pub const DOWNLOAD_BATCH: usize = 64;

/// Maximum number of blocks walked back when looking for a common ancestor.
/// Covers legitimate reorgs while bounding work on a corrupted store.
pub const MAX_REORG_DEPTH: u64 = 512;

/// During initial block download, a contiguous run is only flushed once it
/// holds this many blocks...
pub const IBD_FLUSH_THRESHOLD_BLOCKS: usize = 100;

/// ...or this many bytes, or reaches the best-chain tip, or has waited
/// `IBD_MAX_FLUSH_DELAY`.
pub const IBD_FLUSH_THRESHOLD_BYTES: usize = 8 * 1024 * 1024;

/// Longest a buffered run is held back during initial block download.
pub const IBD_MAX_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on blocks written in one repository batch.
pub const MAX_WRITE_BATCH_BLOCKS: usize = 1_000;

/// Upper bound on bytes written in one repository batch.
pub const MAX_WRITE_BATCH_BYTES: usize = 32 * 1024 * 1024;

/// Pause when there is nothing to do.
pub const IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Pause while waiting on downloads that are already in flight.
pub const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Interval between stats log lines.
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_pending_blocks: usize,
    pub max_pending_bytes: usize,
    pub ibd_download_batch: usize,
    pub download_batch: usize,
    pub max_reorg_depth: u64,
    pub ibd_flush_threshold_blocks: usize,
    pub ibd_flush_threshold_bytes: usize,
    #[serde(with = "duration_millis")]
    pub ibd_max_flush_delay: Duration,
    pub max_write_batch_blocks: usize,
    pub max_write_batch_bytes: usize,
    #[serde(with = "duration_millis")]
    pub idle_interval: Duration,
    #[serde(with = "duration_millis")]
    pub download_poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub stats_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pending_blocks: MAX_PENDING_BLOCKS,
            max_pending_bytes: MAX_PENDING_BYTES,
            ibd_download_batch: IBD_DOWNLOAD_BATCH,
            download_batch: DOWNLOAD_BATCH,
            max_reorg_depth: MAX_REORG_DEPTH,
            ibd_flush_threshold_blocks: IBD_FLUSH_THRESHOLD_BLOCKS,
            ibd_flush_threshold_bytes: IBD_FLUSH_THRESHOLD_BYTES,
            ibd_max_flush_delay: IBD_MAX_FLUSH_DELAY,
            max_write_batch_blocks: MAX_WRITE_BATCH_BLOCKS,
            max_write_batch_bytes: MAX_WRITE_BATCH_BYTES,
            idle_interval: IDLE_INTERVAL,
            download_poll_interval: DOWNLOAD_POLL_INTERVAL,
            stats_interval: STATS_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// Download batch for the current sync mode.
    pub fn download_batch(&self, initial_block_download: bool) -> usize {
        if initial_block_download {
            self.ibd_download_batch
        } else {
            self.download_batch
        }
    }
}
