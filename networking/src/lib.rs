//! Peer-facing side of the block store: the block puller and the peer
//! bookkeeping it relies on.

pub mod puller;
pub mod types;

pub use libp2p_identity::PeerId;
