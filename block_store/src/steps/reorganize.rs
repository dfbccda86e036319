use chain::ChainIndexer;
use containers::ChainPosition;
use networking::puller::BlockFetcher;
use tracing::{info, warn};

use super::{StepContext, StepResult};
use crate::error::{Result, StoreError};
use crate::repository::BlockRepository;
use crate::store_loop::StoreEvent;

/// A completed rewind of the repository tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Rewind {
    pub from: ChainPosition,
    pub to: ChainPosition,
}

impl Rewind {
    pub fn depth(&self) -> u64 {
        self.from.height.distance_from(self.to.height)
    }
}

/// Walk back from the repository tip to the nearest block on the best chain
/// and make it the tip. Returns `None` when the tip is already on the best
/// chain.
pub(crate) fn rewind_to_best_chain(
    repository: &dyn BlockRepository,
    chain: &dyn ChainIndexer,
    max_depth: u64,
) -> Result<Option<Rewind>> {
    let tip = repository.tip();
    if chain.contains(&tip) {
        return Ok(None);
    }

    let mut ancestor = tip;
    let mut depth = 0;
    while !chain.contains(&ancestor) {
        if depth >= max_depth {
            return Err(StoreError::ReorgDepthExceeded {
                depth,
                max: max_depth,
            });
        }
        let parent = repository
            .get(&ancestor.prev_hash)?
            .ok_or(StoreError::MissingBlock(ancestor.prev_hash))?;
        ancestor = parent.position();
        depth += 1;
    }

    repository.set_tip(ancestor)?;
    Ok(Some(Rewind {
        from: tip,
        to: ancestor,
    }))
}

/// Runs when the repository tip left the best chain, or when pending storage
/// or the puller still hold blocks of a branch the best chain abandoned.
pub(super) fn execute<F: BlockFetcher>(ctx: &mut StepContext<'_, F>) -> Result<Option<StepResult>> {
    let chain = ctx.chain;
    let tip_on_chain = chain.contains(&ctx.repository.tip());
    let stale_pending = ctx
        .pending
        .lock()
        .any_rejected(|pending| chain.contains(&pending.position));
    if tip_on_chain && !stale_pending {
        return Ok(None);
    }

    let rewind = rewind_to_best_chain(ctx.repository, chain, ctx.config.max_reorg_depth)?;

    let discarded = ctx
        .pending
        .lock()
        .retain(|pending| chain.contains(&pending.position))
        .len();
    let abandoned = ctx.puller.retain(|position| chain.contains(position));

    match rewind {
        Some(rewind) => {
            warn!(
                from = rewind.from.height.0,
                to = rewind.to.height.0,
                depth = rewind.depth(),
                discarded,
                abandoned,
                "Repository tip rewound onto best chain"
            );
            if let Some(metrics) = ctx.metrics {
                metrics.inc_store_reorgs();
                metrics.observe_store_reorg_depth(rewind.depth() as f64);
            }
            // No subscribers is fine.
            let _ = ctx.events.send(StoreEvent::TipRewound {
                from: rewind.from,
                to: rewind.to,
            });
        }
        None => {
            info!(discarded, abandoned, "Dropped blocks of an abandoned branch");
        }
    }

    Ok(Some(StepResult::Continue))
}
