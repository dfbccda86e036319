use serde::{Deserialize, Serialize};
use std::fmt;

/// Height of a block in the chain. Genesis is height 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Height(pub u64);

impl Height {
    pub const GENESIS: Height = Height(0);

    pub fn next(self) -> Height {
        Height(self.0 + 1)
    }

    /// Parent height, or `None` for genesis.
    pub fn prev(self) -> Option<Height> {
        self.0.checked_sub(1).map(Height)
    }

    /// Number of heights from `other` up to `self`, zero if `other` is above.
    pub fn distance_from(self, other: Height) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Big-endian key used by ordered storage.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prev_of_genesis_is_none() {
        assert_eq!(Height::GENESIS.prev(), None);
        assert_eq!(Height(5).prev(), Some(Height(4)));
    }

    #[test]
    fn test_distance_saturates() {
        assert_eq!(Height(10).distance_from(Height(4)), 6);
        assert_eq!(Height(4).distance_from(Height(10)), 0);
    }

    #[test]
    fn test_big_endian_keys_sort_by_height() {
        assert!(Height(255).to_be_bytes() < Height(256).to_be_bytes());
    }
}
