use containers::{Bytes32, ChainPosition, Height};

/// Read access to the node's best chain of headers.
///
/// Lookups only ever see the active chain: a header that was reorganized
/// away is no longer returned by either lookup.
pub trait ChainIndexer: Send + Sync {
    /// Position of the current best-chain tip.
    fn tip(&self) -> ChainPosition;

    /// Header at `height` on the active chain.
    fn get_header_at(&self, height: Height) -> Option<ChainPosition>;

    /// Header with `hash`, if it is on the active chain.
    fn get_header_by_hash(&self, hash: &Bytes32) -> Option<ChainPosition>;

    /// True when `position` is on the active chain.
    fn contains(&self, position: &ChainPosition) -> bool {
        self.get_header_at(position.height)
            .is_some_and(|header| header.hash == position.hash)
    }
}
