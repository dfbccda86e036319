use std::collections::HashMap;
use std::time::Instant;

use containers::{Bytes32, ChainPosition};
use libp2p_identity::PeerId;
use tokio::task::AbortHandle;

/// A block download assigned to one peer.
#[derive(Debug)]
pub struct DownloadRequest {
    pub position: ChainPosition,
    pub peer_id: PeerId,
    pub requested_at: Instant,
    pub attempt: u32,
    pub(crate) task: Option<AbortHandle>,
}

impl DownloadRequest {
    pub fn hash(&self) -> Bytes32 {
        self.position.hash
    }
}

/// Failure history of one block hash across peers.
#[derive(Debug, Clone, Default)]
pub struct FailureRecord {
    pub failures: u32,
    pub failed_peers: HashMap<PeerId, u32>,
    pub last_failure: Option<Instant>,
}

impl FailureRecord {
    pub fn failures_for(&self, peer_id: &PeerId) -> u32 {
        self.failed_peers.get(peer_id).copied().unwrap_or(0)
    }

    pub fn distinct_peers(&self) -> usize {
        self.failed_peers.len()
    }
}

/// Request records indexed by block hash, with the failure history of hashes
/// that are back in the needed pool. Peers are referenced by id only.
#[derive(Debug, Default)]
pub struct RequestArena {
    in_flight: HashMap<Bytes32, DownloadRequest>,
    failures: HashMap<Bytes32, FailureRecord>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, hash: &Bytes32) -> bool {
        self.in_flight.contains_key(hash)
    }

    pub fn get(&self, hash: &Bytes32) -> Option<&DownloadRequest> {
        self.in_flight.get(hash)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Attempt number the next request for `hash` would carry.
    pub fn next_attempt(&self, hash: &Bytes32) -> u32 {
        self.failures.get(hash).map_or(0, |record| record.failures) + 1
    }

    pub fn insert(&mut self, request: DownloadRequest) {
        self.in_flight.insert(request.hash(), request);
    }

    /// Remove the request for `hash` if it is assigned to `peer_id`.
    pub fn take_if_assigned(&mut self, hash: &Bytes32, peer_id: &PeerId) -> Option<DownloadRequest> {
        match self.in_flight.get(hash) {
            Some(request) if request.peer_id == *peer_id => self.in_flight.remove(hash),
            _ => None,
        }
    }

    pub fn remove(&mut self, hash: &Bytes32) -> Option<DownloadRequest> {
        self.in_flight.remove(hash)
    }

    /// Hashes currently assigned to `peer_id`.
    pub fn assigned_to(&self, peer_id: &PeerId) -> Vec<Bytes32> {
        self.in_flight
            .values()
            .filter(|request| request.peer_id == *peer_id)
            .map(DownloadRequest::hash)
            .collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DownloadRequest> + '_ {
        self.in_flight.drain().map(|(_, request)| request)
    }

    /// Remove and return requests whose position fails `keep`.
    pub fn remove_where<P>(&mut self, mut remove: P) -> Vec<DownloadRequest>
    where
        P: FnMut(&DownloadRequest) -> bool,
    {
        let stale: Vec<Bytes32> = self
            .in_flight
            .values()
            .filter(|request| remove(request))
            .map(DownloadRequest::hash)
            .collect();
        stale
            .iter()
            .filter_map(|hash| self.in_flight.remove(hash))
            .collect()
    }

    pub fn record_failure(&mut self, hash: Bytes32, peer_id: PeerId, now: Instant) -> &FailureRecord {
        let record = self.failures.entry(hash).or_default();
        record.failures += 1;
        *record.failed_peers.entry(peer_id).or_default() += 1;
        record.last_failure = Some(now);
        record
    }

    pub fn failure_record(&self, hash: &Bytes32) -> Option<&FailureRecord> {
        self.failures.get(hash)
    }

    pub fn clear_failures(&mut self, hash: &Bytes32) {
        self.failures.remove(hash);
    }

    /// Drop failure history for hashes nobody needs anymore.
    pub fn retain_failures<P>(&mut self, mut keep: P)
    where
        P: FnMut(&Bytes32) -> bool,
    {
        self.failures.retain(|hash, _| keep(hash));
    }
}
