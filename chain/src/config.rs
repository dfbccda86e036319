/// Target spacing between blocks.
pub const TARGET_BLOCK_SPACING_SECS: u64 = 10;

/// A node whose best header is older than this is considered to be in
/// initial block download.
pub const MAX_TIP_AGE_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub target_block_spacing_secs: u64,
    pub max_tip_age_secs: u64,
}

pub const DEFAULT_CHAIN_CONFIG: ChainConfig = ChainConfig {
    target_block_spacing_secs: TARGET_BLOCK_SPACING_SECS,
    max_tip_age_secs: MAX_TIP_AGE_SECS,
};

impl ChainConfig {
    /// True when a tip with the given timestamp is stale at `now`.
    pub fn is_tip_stale(&self, tip_timestamp: u64, now: u64) -> bool {
        now.saturating_sub(tip_timestamp) > self.max_tip_age_secs
    }
}
