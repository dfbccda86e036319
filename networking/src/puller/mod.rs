/// Block puller for the block store.
///
/// Bridges "which blocks are missing" to the peer network:
///
/// - **Peer Manager**: Tracks connected peers, their advertised heights,
///   requests in flight and delivery record
/// - **Request Arena**: One download request per block hash, plus the
///   failure history used for retry backoff
/// - **Block Puller**: Assigns needed blocks to peers, spawns the fetches,
///   and queues deliveries and failures for non-blocking polling
///
/// ## Flow
///
/// 1. The block store asks for a list of needed chain positions
/// 2. Each position is assigned to the best available peer
/// 3. A task per request awaits the fetch under the request timeout
/// 4. The outcome is queued as an event; nothing blocks the network side
/// 5. The block store polls delivered blocks in delivery order
///
/// ## Peer Selection
///
/// Peers that already failed a block are only reused when nobody else can
/// serve it. Otherwise the peer outside its penalty window with the fewest
/// requests in flight and the best delivery record wins. A block that failed
/// on several distinct peers backs off exponentially.
pub mod block_puller;
pub mod config;
pub mod peer_manager;
pub mod requests;

pub use block_puller::{
    BlockFetcher, BlockPuller, DeliveryFailure, PullerEvent, PullerNotifier, PullerStats,
};
pub use config::*;
pub use peer_manager::{PeerManager, SyncPeer};
pub use requests::{DownloadRequest, FailureRecord, RequestArena};
