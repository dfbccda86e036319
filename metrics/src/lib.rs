pub mod server;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    // Block store
    store_tip_height: IntGauge,
    chain_tip_height: IntGauge,
    pending_blocks: IntGauge,
    pending_bytes: IntGauge,
    sync_phase: IntGauge,
    blocks_flushed: IntCounter,
    flush_batch_size: HistogramVec,
    flush_time: HistogramVec,
    store_reorgs: IntCounterVec,
    store_reorg_depth: HistogramVec,
    // Block puller
    requests_in_flight: IntGauge,
    blocks_delivered: IntCounter,
    delivery_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new("network_peers_connected", "Number of connected peers")).unwrap();
        registry.register(Box::new(peers.clone())).unwrap();

        // Block store
        let store_tip_height = IntGauge::with_opts(Opts::new(
            "block_store_tip_height",
            "Height of the highest block persisted with its full ancestry",
        )).unwrap();
        registry.register(Box::new(store_tip_height.clone())).unwrap();

        let chain_tip_height = IntGauge::with_opts(Opts::new("block_store_chain_tip_height", "Height of the best header chain tip")).unwrap();
        registry.register(Box::new(chain_tip_height.clone())).unwrap();

        let pending_blocks = IntGauge::with_opts(Opts::new("block_store_pending_blocks", "Blocks waiting in pending storage")).unwrap();
        registry.register(Box::new(pending_blocks.clone())).unwrap();

        let pending_bytes = IntGauge::with_opts(Opts::new("block_store_pending_bytes", "Bytes waiting in pending storage")).unwrap();
        registry.register(Box::new(pending_bytes.clone())).unwrap();

        let sync_phase = IntGauge::with_opts(Opts::new(
            "block_store_phase",
            "Loop phase: 0 syncing, 1 idle, 2 reorganizing, 3 stopped",
        )).unwrap();
        registry.register(Box::new(sync_phase.clone())).unwrap();

        let blocks_flushed = IntCounter::with_opts(Opts::new("block_store_blocks_flushed_total", "Blocks written to the repository")).unwrap();
        registry.register(Box::new(blocks_flushed.clone())).unwrap();

        let flush_batch_size = HistogramVec::new(
            HistogramOpts::new("block_store_flush_batch_size", "Blocks per repository write batch")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(flush_batch_size.clone())).unwrap();

        let flush_time = HistogramVec::new(
            HistogramOpts::new("block_store_flush_time_seconds", "Time taken to write a batch")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(flush_time.clone())).unwrap();

        let store_reorgs = IntCounterVec::new(
            Opts::new("block_store_reorgs_total", "Total number of repository tip rewinds"),
            &[],
        ).unwrap();
        registry.register(Box::new(store_reorgs.clone())).unwrap();

        let store_reorg_depth = HistogramVec::new(
            HistogramOpts::new("block_store_reorg_depth", "Depth of repository tip rewinds (in blocks)")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 20.0, 30.0, 50.0, 100.0, 512.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(store_reorg_depth.clone())).unwrap();

        // Block puller
        let requests_in_flight = IntGauge::with_opts(Opts::new("block_puller_requests_in_flight", "Block requests awaiting an answer")).unwrap();
        registry.register(Box::new(requests_in_flight.clone())).unwrap();

        let blocks_delivered = IntCounter::with_opts(Opts::new("block_puller_blocks_delivered_total", "Requested blocks delivered by peers")).unwrap();
        registry.register(Box::new(blocks_delivered.clone())).unwrap();

        let delivery_failures = IntCounterVec::new(
            Opts::new("block_puller_delivery_failures_total", "Failed block requests"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(delivery_failures.clone())).unwrap();

        Self {
            registry,
            peers,
            store_tip_height,
            chain_tip_height,
            pending_blocks,
            pending_bytes,
            sync_phase,
            blocks_flushed,
            flush_batch_size,
            flush_time,
            store_reorgs,
            store_reorg_depth,
            requests_in_flight,
            blocks_delivered,
            delivery_failures,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    // Block store
    pub fn set_store_tip_height(&self, v: i64) {
        self.store_tip_height.set(v);
    }

    pub fn set_chain_tip_height(&self, v: i64) {
        self.chain_tip_height.set(v);
    }

    pub fn set_pending(&self, blocks: i64, bytes: i64) {
        self.pending_blocks.set(blocks);
        self.pending_bytes.set(bytes);
    }

    pub fn set_sync_phase(&self, v: i64) {
        self.sync_phase.set(v);
    }

    pub fn observe_flush(&self, blocks: u64, duration: f64) {
        self.blocks_flushed.inc_by(blocks);
        self.flush_batch_size.with_label_values::<&str>(&[]).observe(blocks as f64);
        self.flush_time.with_label_values::<&str>(&[]).observe(duration);
    }

    pub fn inc_store_reorgs(&self) {
        self.store_reorgs.with_label_values::<&str>(&[]).inc();
    }

    pub fn observe_store_reorg_depth(&self, depth: f64) {
        self.store_reorg_depth.with_label_values::<&str>(&[]).observe(depth);
    }

    // Block puller
    pub fn set_requests_in_flight(&self, v: i64) {
        self.requests_in_flight.set(v);
    }

    /// Bring the puller counters up to the puller's running totals.
    pub fn sync_delivery_totals(&self, delivered: u64, failures_by_reason: &BTreeMap<&'static str, u64>) {
        self.blocks_delivered.inc_by(delivered.saturating_sub(self.blocks_delivered.get()));
        for (reason, total) in failures_by_reason {
            let counter = self.delivery_failures.with_label_values(&[*reason]);
            counter.inc_by(total.saturating_sub(counter.get()));
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;
