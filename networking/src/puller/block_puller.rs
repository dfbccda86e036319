use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use containers::{Block, Bytes32, ChainPosition, Height, PendingBlock};
use libp2p_identity::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    config::PullerConfig,
    peer_manager::PeerManager,
    requests::{DownloadRequest, RequestArena},
};
use crate::types::{ConnectionState, PeerCount};

/// Network requester trait for fetching blocks.
///
/// Abstracts the network layer to allow testing with mocks.
#[async_trait::async_trait]
pub trait BlockFetcher: Send + Sync + 'static {
    /// Request one block by hash from a peer.
    ///
    /// Returns the block if the peer served it, or None if the peer does
    /// not have it or the request failed.
    async fn fetch_block(&self, peer_id: PeerId, hash: Bytes32) -> Option<Block>;
}

/// Why a download did not produce the requested block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DeliveryFailure {
    #[error("request timed out")]
    Timeout,
    #[error("peer does not have the block")]
    NotFound,
    #[error("peer sent a different block")]
    HashMismatch,
    #[error("peer disconnected")]
    Disconnected,
    #[error("failure reported by the network layer")]
    Reported,
}

impl DeliveryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryFailure::Timeout => "timeout",
            DeliveryFailure::NotFound => "not_found",
            DeliveryFailure::HashMismatch => "hash_mismatch",
            DeliveryFailure::Disconnected => "disconnected",
            DeliveryFailure::Reported => "reported",
        }
    }
}

/// Notifications from the network side, queued until the next poll.
#[derive(Debug)]
pub enum PullerEvent {
    PeerConnected {
        peer_id: PeerId,
        best_height: Option<Height>,
    },
    PeerStatus {
        peer_id: PeerId,
        best_height: Height,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    BlockDelivered {
        peer_id: PeerId,
        block: Block,
    },
    RequestFailed {
        peer_id: PeerId,
        hash: Bytes32,
        reason: DeliveryFailure,
    },
}

/// Clonable handle the network layer uses to report peer and download
/// events. Never blocks; events sent after the puller is gone are dropped.
#[derive(Debug, Clone)]
pub struct PullerNotifier {
    sender: mpsc::UnboundedSender<PullerEvent>,
}

impl PullerNotifier {
    pub fn peer_connected(&self, peer_id: PeerId, best_height: Option<Height>) {
        self.send(PullerEvent::PeerConnected {
            peer_id,
            best_height,
        });
    }

    pub fn peer_status(&self, peer_id: PeerId, best_height: Height) {
        self.send(PullerEvent::PeerStatus {
            peer_id,
            best_height,
        });
    }

    pub fn peer_disconnected(&self, peer_id: PeerId) {
        self.send(PullerEvent::PeerDisconnected { peer_id });
    }

    pub fn block_delivered(&self, peer_id: PeerId, block: Block) {
        self.send(PullerEvent::BlockDelivered { peer_id, block });
    }

    pub fn peer_failed(&self, peer_id: PeerId, hash: Bytes32) {
        self.send(PullerEvent::RequestFailed {
            peer_id,
            hash,
            reason: DeliveryFailure::Reported,
        });
    }

    fn send(&self, event: PullerEvent) {
        if self.sender.send(event).is_err() {
            trace!("Block puller gone, dropping event");
        }
    }
}

/// Statistics about the block puller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullerStats {
    pub in_flight: usize,
    pub queued_deliveries: usize,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub failures_by_reason: BTreeMap<&'static str, u64>,
    pub peers: PeerCount,
    pub network_best_height: Option<Height>,
}

/// Tracks which blocks are being downloaded from which peer.
///
/// The puller never blocks its caller: `request` spawns one task per
/// assigned block, and every outcome comes back through the event queue
/// drained by the next `request` or `try_next_delivered`. Timeouts are
/// enforced here, so callers only ever see a block as needed or delivered.
///
/// Must be driven from inside a tokio runtime.
pub struct BlockPuller<F: BlockFetcher> {
    fetcher: Arc<F>,
    config: PullerConfig,
    peers: PeerManager,
    requests: RequestArena,
    delivered: VecDeque<PendingBlock>,
    events: mpsc::UnboundedReceiver<PullerEvent>,
    notifier: PullerNotifier,
    delivered_total: u64,
    failed_total: u64,
    failures_by_reason: BTreeMap<&'static str, u64>,
}

impl<F: BlockFetcher> BlockPuller<F> {
    pub fn new(fetcher: F, config: PullerConfig) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            fetcher: Arc::new(fetcher),
            peers: PeerManager::new(config.max_concurrent_requests),
            config,
            requests: RequestArena::new(),
            delivered: VecDeque::new(),
            events,
            notifier: PullerNotifier { sender },
            delivered_total: 0,
            failed_total: 0,
            failures_by_reason: BTreeMap::new(),
        }
    }

    pub fn notifier(&self) -> PullerNotifier {
        self.notifier.clone()
    }

    pub fn config(&self) -> &PullerConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    /// Register a connected peer directly, bypassing the event queue.
    pub fn add_peer(&mut self, peer_id: PeerId, best_height: Option<Height>) {
        let peer = self.peers.add_peer(peer_id, ConnectionState::Connected);
        if best_height.is_some() {
            peer.best_height = best_height;
        }
        debug!(peer = %peer_id, best_height = ?best_height, "Peer added to block puller");
    }

    /// Forget a peer, returning every block it was fetching to the needed pool.
    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        for hash in self.requests.assigned_to(peer_id) {
            self.fail_request(*peer_id, hash, DeliveryFailure::Disconnected);
        }
        self.peers.remove_peer(peer_id);
        debug!(peer = %peer_id, "Peer removed from block puller");
    }

    pub fn is_requested(&self, hash: &Bytes32) -> bool {
        self.requests.contains(hash)
    }

    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    pub fn request_for(&self, hash: &Bytes32) -> Option<&DownloadRequest> {
        self.requests.get(hash)
    }

    /// Assign needed blocks to peers.
    ///
    /// Positions already in flight or still backing off are skipped. Stops at
    /// the first block no peer can take. Returns the number of requests
    /// issued.
    pub fn request(&mut self, needed: Vec<ChainPosition>) -> usize {
        self.process_events();

        let now = Instant::now();
        let mut issued = 0;

        for position in needed {
            if self.requests.contains(&position.hash) {
                continue;
            }
            if !self.retry_delay(&position.hash, now).is_zero() {
                trace!(hash = %position.hash.short(), "Block still backing off");
                continue;
            }

            let record = self.requests.failure_record(&position.hash);
            let selected = self.peers.select_peer_for_request(position.height, now, |peer| {
                record.map_or(0, |record| record.failures_for(peer))
            });

            let Some(peer_id) = selected else {
                debug!(
                    height = position.height.0,
                    in_flight = self.requests.len(),
                    "No peer available for block request"
                );
                break;
            };

            self.dispatch(position, peer_id, now);
            issued += 1;
        }

        if issued > 0 {
            debug!(issued, in_flight = self.requests.len(), "Issued block requests");
        }

        issued
    }

    /// Next completed download, in delivery order.
    pub fn try_next_delivered(&mut self) -> Option<PendingBlock> {
        self.process_events();
        self.delivered.pop_front()
    }

    /// True when `hash` was delivered and is waiting to be polled.
    pub fn has_delivered(&self, hash: &Bytes32) -> bool {
        self.delivered.iter().any(|pending| pending.hash() == *hash)
    }

    /// Take a specific delivered block out of the queue, ahead of delivery
    /// order.
    pub fn take_delivered(&mut self, hash: &Bytes32) -> Option<PendingBlock> {
        self.process_events();
        let index = self
            .delivered
            .iter()
            .position(|pending| pending.hash() == *hash)?;
        self.delivered.remove(index)
    }

    /// A request timed out or the peer could not serve it.
    ///
    /// The hash goes back to the needed pool and the peer is deprioritized
    /// for the penalty window. Returns false if no such request was in flight.
    pub fn on_peer_failure(&mut self, peer_id: PeerId, hash: Bytes32) -> bool {
        self.fail_request(peer_id, hash, DeliveryFailure::Reported)
    }

    /// Stop fetching `hash`. Returns true if a request was in flight.
    pub fn abandon(&mut self, hash: &Bytes32) -> bool {
        match self.requests.remove(hash) {
            Some(request) => {
                self.release(request);
                true
            }
            None => false,
        }
    }

    /// Abandon requests and drop queued deliveries whose position fails
    /// `keep`. Returns the number of requests abandoned.
    pub fn retain<P>(&mut self, keep: P) -> usize
    where
        P: Fn(&ChainPosition) -> bool,
    {
        self.process_events();
        self.delivered.retain(|pending| keep(&pending.position));

        let stale = self.requests.remove_where(|request| !keep(&request.position));
        let abandoned = stale.len();
        for request in stale {
            self.release(request);
        }
        abandoned
    }

    /// Drop failure history for hashes `keep` rejects.
    pub fn forget_failures<P>(&mut self, keep: P)
    where
        P: FnMut(&Bytes32) -> bool,
    {
        self.requests.retain_failures(keep);
    }

    /// Abandon everything in flight. Used on shutdown.
    pub fn abandon_all(&mut self) -> usize {
        let requests: Vec<DownloadRequest> = self.requests.drain().collect();
        let abandoned = requests.len();
        for request in requests {
            self.release(request);
        }
        abandoned
    }

    /// Time left before `hash` may be requested again.
    pub fn retry_delay(&self, hash: &Bytes32, now: Instant) -> Duration {
        let Some(record) = self.requests.failure_record(hash) else {
            return Duration::ZERO;
        };
        let Some(last_failure) = record.last_failure else {
            return Duration::ZERO;
        };
        let backoff = self
            .config
            .backoff_for(record.failures, record.distinct_peers());
        (last_failure + backoff).saturating_duration_since(now)
    }

    pub fn stats(&self) -> PullerStats {
        PullerStats {
            in_flight: self.requests.len(),
            queued_deliveries: self.delivered.len(),
            delivered_total: self.delivered_total,
            failed_total: self.failed_total,
            failures_by_reason: self.failures_by_reason.clone(),
            peers: self.peers.peer_count(),
            network_best_height: self.peers.network_best_height(),
        }
    }

    /// Drain the event queue without blocking.
    pub fn process_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PullerEvent) {
        match event {
            PullerEvent::PeerConnected {
                peer_id,
                best_height,
            } => self.add_peer(peer_id, best_height),
            PullerEvent::PeerStatus {
                peer_id,
                best_height,
            } => self.peers.update_best_height(&peer_id, best_height),
            PullerEvent::PeerDisconnected { peer_id } => self.remove_peer(&peer_id),
            PullerEvent::BlockDelivered { peer_id, block } => self.on_delivered(peer_id, block),
            PullerEvent::RequestFailed {
                peer_id,
                hash,
                reason,
            } => {
                self.fail_request(peer_id, hash, reason);
            }
        }
    }

    fn on_delivered(&mut self, peer_id: PeerId, block: Block) {
        let hash = block.hash();
        let Some(request) = self.requests.take_if_assigned(&hash, &peer_id) else {
            trace!(peer = %peer_id, hash = %hash.short(), "Ignoring block that is not in flight");
            return;
        };
        if let Some(task) = &request.task {
            task.abort();
        }

        self.peers.on_request_complete(&peer_id);
        self.requests.clear_failures(&hash);
        self.delivered_total += 1;

        trace!(
            peer = %peer_id,
            height = request.position.height.0,
            attempt = request.attempt,
            "Block delivered"
        );

        self.delivered
            .push_back(PendingBlock::new(block, request.position));
    }

    fn fail_request(&mut self, peer_id: PeerId, hash: Bytes32, reason: DeliveryFailure) -> bool {
        let Some(request) = self.requests.take_if_assigned(&hash, &peer_id) else {
            trace!(peer = %peer_id, hash = %hash.short(), "Failure for request that is not in flight");
            return false;
        };
        if let Some(task) = &request.task {
            task.abort();
        }

        let now = Instant::now();
        self.peers
            .on_request_failure(&peer_id, now + self.config.peer_penalty);
        let record = self.requests.record_failure(hash, peer_id, now);
        self.failed_total += 1;
        *self.failures_by_reason.entry(reason.as_str()).or_default() += 1;

        if reason == DeliveryFailure::Disconnected {
            debug!(peer = %peer_id, height = request.position.height.0, "Request lost to disconnect");
        } else {
            warn!(
                peer = %peer_id,
                height = request.position.height.0,
                failures = record.failures,
                distinct_peers = record.distinct_peers(),
                reason = %reason,
                "Block download failed"
            );
        }

        true
    }

    fn dispatch(&mut self, position: ChainPosition, peer_id: PeerId, now: Instant) {
        let hash = position.hash;
        let attempt = self.requests.next_attempt(&hash);
        let fetcher = Arc::clone(&self.fetcher);
        let notifier = self.notifier.clone();
        let timeout = self.config.request_timeout;

        let task = tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, fetcher.fetch_block(peer_id, hash)).await {
                Ok(Some(block)) if block.hash() == hash => {
                    PullerEvent::BlockDelivered { peer_id, block }
                }
                Ok(Some(_)) => PullerEvent::RequestFailed {
                    peer_id,
                    hash,
                    reason: DeliveryFailure::HashMismatch,
                },
                Ok(None) => PullerEvent::RequestFailed {
                    peer_id,
                    hash,
                    reason: DeliveryFailure::NotFound,
                },
                Err(_) => PullerEvent::RequestFailed {
                    peer_id,
                    hash,
                    reason: DeliveryFailure::Timeout,
                },
            };
            notifier.send(event);
        });

        self.peers.on_request_start(&peer_id);
        self.requests.insert(DownloadRequest {
            position,
            peer_id,
            requested_at: now,
            attempt,
            task: Some(task.abort_handle()),
        });

        trace!(peer = %peer_id, height = position.height.0, attempt, "Requested block");
    }

    fn release(&mut self, request: DownloadRequest) {
        if let Some(task) = &request.task {
            task.abort();
        }
        self.peers.on_request_abandoned(&request.peer_id);
    }
}

impl<F: BlockFetcher> Drop for BlockPuller<F> {
    fn drop(&mut self) {
        for request in self.requests.drain() {
            if let Some(task) = &request.task {
                task.abort();
            }
        }
    }
}
