//! The synchronization steps.
//!
//! Each tick the loop offers the steps the tick in priority order; the first
//! one whose precondition holds runs and decides what the loop does next.
//!
//! - **Reorganize**: rewind the repository onto the best chain
//! - **CatchupFromBuffer**: write the buffered run that extends the tip
//! - **Download**: collect deliveries and request missing blocks
//! - **Idle**: nothing to do

mod catchup;
mod download;
mod idle;
mod reorganize;

use std::time::{Duration, Instant};

use chain::{ChainIndexer, ChainState};
use metrics::Metrics;
use networking::puller::{BlockFetcher, BlockPuller};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::pending::PendingStorage;
use crate::repository::BlockRepository;
use crate::store_loop::{LoopPhase, StoreEvent};

pub(crate) use reorganize::rewind_to_best_chain;

/// What the loop does after a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Run the next tick right away.
    Continue,
    /// Sleep before the next tick, waking early on shutdown.
    Pause(Duration),
    /// Exit the loop.
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncStep {
    Reorganize,
    CatchupFromBuffer,
    Download,
    Idle,
}

impl SyncStep {
    /// Steps in the order they are offered the tick.
    pub const PRIORITY: [SyncStep; 4] = [
        SyncStep::Reorganize,
        SyncStep::CatchupFromBuffer,
        SyncStep::Download,
        SyncStep::Idle,
    ];

    pub fn phase(self) -> LoopPhase {
        match self {
            SyncStep::Reorganize => LoopPhase::Reorganizing,
            SyncStep::CatchupFromBuffer | SyncStep::Download => LoopPhase::Syncing,
            SyncStep::Idle => LoopPhase::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStep::Reorganize => "reorganize",
            SyncStep::CatchupFromBuffer => "catchup_from_buffer",
            SyncStep::Download => "download",
            SyncStep::Idle => "idle",
        }
    }

    /// Run the step if its precondition holds.
    fn execute<F: BlockFetcher>(self, ctx: &mut StepContext<'_, F>) -> Result<Option<StepResult>> {
        match self {
            SyncStep::Reorganize => reorganize::execute(ctx),
            SyncStep::CatchupFromBuffer => catchup::execute(ctx),
            SyncStep::Download => download::execute(ctx),
            SyncStep::Idle => idle::execute(ctx),
        }
    }
}

/// State of a flush held back during initial block download, carried
/// across ticks.
#[derive(Debug, Default)]
pub(crate) struct FlushDeferral {
    /// When the run extending the tip was first held back.
    pub since: Option<Instant>,
    /// Set by Download when it could request nothing and nothing is in
    /// flight, so the run will not grow by waiting.
    pub download_stalled: bool,
}

/// Everything a step may read or mutate during one tick.
pub(crate) struct StepContext<'a, F: BlockFetcher> {
    pub repository: &'a dyn BlockRepository,
    pub chain: &'a dyn ChainIndexer,
    pub chain_state: &'a ChainState,
    pub pending: &'a Mutex<PendingStorage>,
    pub puller: &'a mut BlockPuller<F>,
    pub config: &'a StoreConfig,
    pub events: &'a broadcast::Sender<StoreEvent>,
    pub metrics: Option<&'a Metrics>,
    pub deferral: &'a mut FlushDeferral,
}

/// Result of one tick: the step that ran and what it asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TickOutcome {
    pub step: Option<SyncStep>,
    pub result: StepResult,
}

/// Offer the tick to each step in priority order.
pub(crate) fn run_tick<F: BlockFetcher>(
    ctx: &mut StepContext<'_, F>,
    shutdown: &CancellationToken,
) -> Result<TickOutcome> {
    if shutdown.is_cancelled() {
        return Ok(TickOutcome {
            step: None,
            result: StepResult::Stop,
        });
    }

    for step in SyncStep::PRIORITY {
        if let Some(result) = step.execute(ctx)? {
            return Ok(TickOutcome {
                step: Some(step),
                result,
            });
        }
    }

    // Idle always accepts the tick.
    Ok(TickOutcome {
        step: Some(SyncStep::Idle),
        result: StepResult::Pause(ctx.config.idle_interval),
    })
}

#[cfg(test)]
mod tests;
