use std::time::Instant;

use networking::puller::BlockFetcher;
use tracing::{debug, error, info};

use super::{StepContext, StepResult};
use crate::error::Result;
use crate::store_loop::StoreEvent;

/// Write the buffered run that extends the repository tip.
///
/// During initial block download small runs are held back so the repository
/// sees fewer, larger batches; a run is written once it crosses the flush
/// threshold, reaches the best-chain tip, fills the buffer, has waited
/// `ibd_max_flush_delay`, or Download has nothing left to fetch for it.
///
/// The pending lock is held until the write commits, so readers always find
/// the run in either pending storage or the repository.
pub(super) fn execute<F: BlockFetcher>(ctx: &mut StepContext<'_, F>) -> Result<Option<StepResult>> {
    let tip = ctx.repository.tip();
    let mut pending = ctx.pending.lock();

    let pruned = pending.prune_at_or_below(tip.height);
    if pruned > 0 {
        debug!(pruned, tip = tip.height.0, "Dropped pending blocks already behind the tip");
    }

    let run = pending.peek_contiguous_run(&tip);
    let Some(last) = run.last else {
        ctx.deferral.since = None;
        return Ok(None);
    };

    if ctx.chain_state.is_initial_block_download() && !pending.is_full() {
        let since = *ctx.deferral.since.get_or_insert_with(Instant::now);
        let large_enough = run.blocks >= ctx.config.ibd_flush_threshold_blocks
            || run.bytes >= ctx.config.ibd_flush_threshold_bytes;
        let reaches_chain_tip = last.height >= ctx.chain.tip().height;
        let overdue = since.elapsed() >= ctx.config.ibd_max_flush_delay;
        if !(large_enough || reaches_chain_tip || overdue || ctx.deferral.download_stalled) {
            return Ok(None);
        }
        if !large_enough && !reaches_chain_tip {
            debug!(blocks = run.blocks, overdue, "Flushing short run held back during IBD");
        }
    }
    ctx.deferral.since = None;

    let batch = pending.take_contiguous_run(
        &tip,
        ctx.config.max_write_batch_blocks,
        ctx.config.max_write_batch_bytes,
    );

    let started = Instant::now();
    let new_tip = match ctx.repository.put_batch(&batch) {
        Ok(new_tip) => new_tip,
        Err(err) => {
            error!(tip = tip.height.0, blocks = batch.len(), %err, "Failed to write pending run");
            for block in batch {
                pending.force_add(block.hash(), block);
            }
            return Err(err);
        }
    };
    drop(pending);

    if let Some(metrics) = ctx.metrics {
        metrics.observe_flush(batch.len() as u64, started.elapsed().as_secs_f64());
    }
    info!(
        from = tip.height.0,
        to = new_tip.height.0,
        blocks = batch.len(),
        "Flushed pending blocks"
    );
    let _ = ctx.events.send(StoreEvent::TipAdvanced {
        tip: new_tip,
        blocks: batch.len(),
    });

    Ok(Some(StepResult::Continue))
}
