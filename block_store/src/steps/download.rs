use containers::{ChainPosition, Height};
use networking::puller::BlockFetcher;
use tracing::{debug, trace};

use super::{StepContext, StepResult};
use crate::error::Result;

/// Move delivered blocks into pending storage and request what is missing
/// between the repository tip and the best-chain tip.
///
/// Runs whenever the repository is behind the best chain or deliveries are
/// waiting. Requests are budgeted so that pending plus in-flight blocks stay
/// within the buffer's block cap.
pub(super) fn execute<F: BlockFetcher>(ctx: &mut StepContext<'_, F>) -> Result<Option<StepResult>> {
    let tip = ctx.repository.tip();
    let chain_tip = ctx.chain.tip();
    let received = drain_deliveries(ctx, tip.height);

    if tip.height >= chain_tip.height {
        ctx.deferral.download_stalled = false;
        return Ok(if received > 0 {
            Some(StepResult::Continue)
        } else {
            None
        });
    }

    let successor = ctx.chain.get_header_at(tip.height.next());
    if ctx.pending.lock().is_full() {
        ctx.deferral.download_stalled = false;
        // Only the block right after the tip can free space; everything
        // else waits for a flush.
        let unblocked = match successor {
            Some(successor) => unblock_successor(ctx, successor),
            None => false,
        };
        debug!(tip = tip.height.0, unblocked, "Pending storage full, throttling downloads");
        return Ok(Some(if unblocked {
            StepResult::Continue
        } else {
            StepResult::Pause(ctx.config.idle_interval)
        }));
    }

    let needed = needed_positions(ctx, tip.height, chain_tip.height);
    let issued = if needed.is_empty() {
        0
    } else {
        ctx.puller.request(needed)
    };

    // Failure history only matters for blocks that may still be requested.
    let chain = ctx.chain;
    ctx.puller.forget_failures(|hash| {
        chain
            .get_header_by_hash(hash)
            .is_some_and(|position| position.height > tip.height)
    });

    ctx.deferral.download_stalled = issued == 0 && ctx.puller.in_flight() == 0;

    trace!(
        tip = tip.height.0,
        chain_tip = chain_tip.height.0,
        received,
        issued,
        in_flight = ctx.puller.in_flight(),
        "Download step"
    );

    Ok(Some(if received > 0 || issued > 0 {
        StepResult::Continue
    } else {
        StepResult::Pause(ctx.config.download_poll_interval)
    }))
}

/// Move deliveries into pending storage while it has room. Blocks no longer
/// on the best chain or already at or below the tip are dropped.
fn drain_deliveries<F: BlockFetcher>(ctx: &mut StepContext<'_, F>, tip_height: Height) -> usize {
    let mut pending = ctx.pending.lock();
    let mut received = 0;
    while !pending.is_full() {
        let Some(delivered) = ctx.puller.try_next_delivered() else {
            break;
        };
        if delivered.height() <= tip_height || !ctx.chain.contains(&delivered.position) {
            trace!(height = delivered.height().0, "Dropping delivery off the best chain");
            continue;
        }
        if pending.force_add(delivered.hash(), delivered) {
            received += 1;
        }
    }
    received
}

/// Make sure the block right after the tip is buffered or on its way.
/// Returns true if that changed anything.
fn unblock_successor<F: BlockFetcher>(ctx: &mut StepContext<'_, F>, successor: ChainPosition) -> bool {
    let mut pending = ctx.pending.lock();
    if pending.contains(&successor.hash) {
        return false;
    }
    if let Some(delivered) = ctx.puller.take_delivered(&successor.hash) {
        return pending.force_add(successor.hash, delivered);
    }
    drop(pending);
    if ctx.puller.is_requested(&successor.hash) {
        return false;
    }
    ctx.puller.request(vec![successor]) > 0
}

/// Positions above the tip that are neither buffered nor requested, lowest
/// first, limited by the download batch and the remaining buffer budget.
fn needed_positions<F: BlockFetcher>(
    ctx: &StepContext<'_, F>,
    tip_height: Height,
    chain_tip_height: Height,
) -> Vec<ChainPosition> {
    let pending = ctx.pending.lock();
    let batch = ctx
        .config
        .download_batch(ctx.chain_state.is_initial_block_download());
    let budget = pending
        .free_slots()
        .saturating_sub(ctx.puller.in_flight());
    let limit = batch.min(budget);

    let mut needed = Vec::with_capacity(limit);
    let mut height = tip_height.next();
    while needed.len() < limit && height <= chain_tip_height {
        let Some(position) = ctx.chain.get_header_at(height) else {
            break;
        };
        if !pending.contains(&position.hash)
            && !ctx.puller.is_requested(&position.hash)
            && !ctx.puller.has_delivered(&position.hash)
        {
            needed.push(position);
        }
        height = height.next();
    }
    needed
}
