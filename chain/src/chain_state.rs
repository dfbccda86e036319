use parking_lot::RwLock;
use std::time::SystemTime;

/// Node-wide chain status flags read by the block store.
///
/// Only the initial-block-download flag matters here; it changes batching
/// and throttling, never correctness.
#[derive(Debug)]
pub struct ChainState {
    ibd: RwLock<IbdStatus>,
}

#[derive(Debug, Clone, Copy)]
struct IbdStatus {
    active: bool,
    since: SystemTime,
}

impl ChainState {
    pub fn new(initial_block_download: bool) -> Self {
        Self {
            ibd: RwLock::new(IbdStatus {
                active: initial_block_download,
                since: SystemTime::now(),
            }),
        }
    }

    pub fn is_initial_block_download(&self) -> bool {
        self.ibd.read().active
    }

    /// When the flag last changed.
    pub fn initial_block_download_since(&self) -> SystemTime {
        self.ibd.read().since
    }

    pub fn set_initial_block_download(&self, active: bool, since: SystemTime) {
        let mut status = self.ibd.write();
        if status.active != active {
            tracing::info!(ibd = active, "Initial block download state changed");
        }
        *status = IbdStatus { active, since };
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new(false)
    }
}
