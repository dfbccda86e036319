use networking::puller::BlockFetcher;
use tracing::trace;

use super::{StepContext, StepResult};
use crate::error::Result;

pub(super) fn execute<F: BlockFetcher>(ctx: &mut StepContext<'_, F>) -> Result<Option<StepResult>> {
    trace!(
        tip = ctx.repository.tip().height.0,
        pending = ctx.pending.lock().len(),
        "Nothing to do"
    );
    Ok(Some(StepResult::Pause(ctx.config.idle_interval)))
}
