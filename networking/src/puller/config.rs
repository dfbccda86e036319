/// Block puller configuration constants.
///
/// Operational parameters for block downloads: concurrency, timeouts and
/// retry pacing.
use std::time::Duration;

use serde::Deserialize;

/// Maximum concurrent block requests to a single peer.
pub const MAX_CONCURRENT_REQUESTS: usize = 16;

/// A request not answered within this time counts as a peer failure.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a peer that failed a request is deprioritized.
pub const PEER_PENALTY: Duration = Duration::from_secs(5);

/// First retry delay once a hash has failed on several peers.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound for the retry delay of a single hash.
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Number of distinct peers that must fail a hash before retries back off.
pub const BACKOFF_AFTER_DISTINCT_PEERS: usize = 2;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PullerConfig {
    pub max_concurrent_requests: usize,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub peer_penalty: Duration,
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
    pub backoff_after_distinct_peers: usize,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            request_timeout: REQUEST_TIMEOUT,
            peer_penalty: PEER_PENALTY,
            backoff_base: BACKOFF_BASE,
            backoff_max: BACKOFF_MAX,
            backoff_after_distinct_peers: BACKOFF_AFTER_DISTINCT_PEERS,
        }
    }
}

impl PullerConfig {
    /// Retry delay for a hash that failed `failures` times on
    /// `distinct_peers` peers. Zero until enough distinct peers failed it.
    pub fn backoff_for(&self, failures: u32, distinct_peers: usize) -> Duration {
        if distinct_peers < self.backoff_after_distinct_peers {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(self.backoff_after_distinct_peers as u32).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Durations in config files are plain millisecond integers.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
