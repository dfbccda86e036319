use std::collections::HashMap;
use std::time::Instant;

use containers::Height;
use libp2p_identity::PeerId;

use crate::types::{ConnectionState, PeerCount};

/// Puller-specific peer state.
///
/// Wraps peer information with download bookkeeping: advertised best height,
/// requests in flight, delivery record and penalty window.
#[derive(Debug, Clone)]
pub struct SyncPeer {
    pub peer_id: PeerId,
    pub connection_state: ConnectionState,
    pub best_height: Option<Height>,
    pub requests_in_flight: usize,
    pub blocks_delivered: u64,
    pub failures: u64,
    pub penalized_until: Option<Instant>,
}

impl SyncPeer {
    pub fn new(peer_id: PeerId, connection_state: ConnectionState) -> Self {
        Self {
            peer_id,
            connection_state,
            best_height: None,
            requests_in_flight: 0,
            blocks_delivered: 0,
            failures: 0,
            penalized_until: None,
        }
    }

    /// Check if peer is connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Check if peer is available for new requests: connected and below the
    /// per-peer request cap.
    pub fn is_available(&self, max_in_flight: usize) -> bool {
        self.is_connected() && self.requests_in_flight < max_in_flight
    }

    /// Check if peer likely has the block at `height`. Peers that never
    /// reported a height are assumed to have everything.
    pub fn has_height(&self, height: Height) -> bool {
        self.best_height.is_none_or(|best| best >= height)
    }

    pub fn is_penalized(&self, now: Instant) -> bool {
        self.penalized_until.is_some_and(|until| until > now)
    }

    /// Mark that a request has been sent to this peer.
    pub fn on_request_start(&mut self) {
        self.requests_in_flight += 1;
    }

    /// Mark that a request was answered with the block.
    pub fn on_request_complete(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
        self.blocks_delivered += 1;
        self.penalized_until = None;
    }

    /// Mark that a request failed; the peer sits out until `penalty_until`.
    pub fn on_request_failure(&mut self, penalty_until: Instant) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
        self.failures += 1;
        self.penalized_until = Some(penalty_until);
    }

    /// Release a request slot without judging the peer.
    pub fn on_request_abandoned(&mut self) {
        self.requests_in_flight = self.requests_in_flight.saturating_sub(1);
    }
}

/// Peer manager for block downloads.
///
/// Tracks peer status, selects peers for requests, and enforces the
/// per-peer concurrency limit.
#[derive(Debug, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, SyncPeer>,
    max_concurrent_requests: usize,
}

impl PeerManager {
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_concurrent_requests,
        }
    }

    /// Add a peer to the manager.
    pub fn add_peer(
        &mut self,
        peer_id: PeerId,
        connection_state: ConnectionState,
    ) -> &mut SyncPeer {
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| SyncPeer::new(peer_id, connection_state));
        peer.connection_state = connection_state;
        peer
    }

    /// Remove a peer from the manager.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<SyncPeer> {
        self.peers.remove(peer_id)
    }

    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&SyncPeer> {
        self.peers.get(peer_id)
    }

    /// Update the best height a peer advertises.
    pub fn update_best_height(&mut self, peer_id: &PeerId, height: Height) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.best_height = Some(height);
        }
    }

    /// Select a peer for the block at `height`.
    ///
    /// Candidates are connected peers under the request cap that likely have
    /// the block. Among them, prefer in order: peers that have not failed this
    /// block before (`failed_for_block`), peers outside their penalty window,
    /// fewer requests in flight, more blocks delivered. Ties break on peer id
    /// so selection is deterministic.
    pub fn select_peer_for_request<F>(
        &self,
        height: Height,
        now: Instant,
        failed_for_block: F,
    ) -> Option<PeerId>
    where
        F: Fn(&PeerId) -> u32,
    {
        self.peers
            .values()
            .filter(|peer| peer.is_available(self.max_concurrent_requests))
            .filter(|peer| peer.has_height(height))
            .min_by_key(|peer| {
                (
                    failed_for_block(&peer.peer_id),
                    peer.is_penalized(now),
                    peer.requests_in_flight,
                    std::cmp::Reverse(peer.blocks_delivered),
                    peer.peer_id,
                )
            })
            .map(|peer| peer.peer_id)
    }

    /// Highest height advertised by any connected peer.
    pub fn network_best_height(&self) -> Option<Height> {
        self.peers
            .values()
            .filter(|peer| peer.is_connected())
            .filter_map(|peer| peer.best_height)
            .max()
    }

    pub fn on_request_start(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_start();
        }
    }

    pub fn on_request_complete(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_complete();
        }
    }

    pub fn on_request_failure(&mut self, peer_id: &PeerId, penalty_until: Instant) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_failure(penalty_until);
        }
    }

    pub fn on_request_abandoned(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_request_abandoned();
        }
    }

    pub fn peer_count(&self) -> PeerCount {
        PeerCount::from_states(self.peers.values().map(|peer| peer.connection_state))
    }

    /// Total capacity left for new requests across connected peers.
    pub fn free_slots(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.is_connected())
            .map(|peer| {
                self.max_concurrent_requests
                    .saturating_sub(peer.requests_in_flight)
            })
            .sum()
    }
}
