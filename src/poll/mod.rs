//! Polling supplement to the push channel.
//!
//! Push delivery is best-effort: frames are lost across disconnects and the
//! enrichment API lags the chain. On a fixed interval this task re-fetches
//! the enrichment snapshot and, where a chain reader is wired, cycle status
//! and slip evaluations for everything still unsettled. Results feed the
//! same merge pipeline as push events, so arrival order never matters.

use crate::chain::ChainReader;
use crate::enrichment::EnrichmentClient;
use crate::rollover::rollover_record;
use crate::slips::{SlipSignal, SlipTracker};
use alloy_primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct PollingSupplement {
    tracker: SlipTracker,
    enrichment: EnrichmentClient,
    chain: Option<Arc<dyn ChainReader>>,
    user: Address,
    interval: Duration,
}

impl PollingSupplement {
    pub fn new(
        tracker: SlipTracker,
        enrichment: EnrichmentClient,
        chain: Option<Arc<dyn ChainReader>>,
        user: Address,
        interval: Duration,
    ) -> Self {
        Self {
            tracker,
            enrichment,
            chain,
            user,
            interval,
        }
    }

    /// Run forever on the configured interval.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    async fn poll_once(&self) {
        match self.enrichment.fetch_user_slips(&self.user).await {
            Ok(slips) => {
                debug!(slips = slips.len(), "enrichment snapshot fetched");
                for slip in slips {
                    self.tracker.merge(SlipSignal::Snapshot(slip));
                }
            }
            // Stale data stays on display; the next tick retries.
            Err(e) => warn!(error = %e, "enrichment poll failed, retaining stale data"),
        }

        if let Some(chain) = &self.chain {
            poll_chain(&self.tracker, chain.as_ref()).await;
        }
    }
}

/// Re-read cycle status for unresolved cycles and evaluations for unsettled
/// slips, and recompute the rollover feeding the prize-pool display.
pub(crate) async fn poll_chain(tracker: &SlipTracker, chain: &dyn ChainReader) {
    for cycle_id in tracker.unresolved_cycles() {
        match chain.get_cycle_status(cycle_id).await {
            Ok(status) => tracker.merge(SlipSignal::Cycle {
                cycle_id: status.cycle_id,
                resolved: status.resolved,
            }),
            Err(e) => warn!(cycle = cycle_id, error = %e, "cycle status read failed"),
        }

        if cycle_id > 1 {
            let previous = cycle_id - 1;
            let pool = chain.daily_prize_pool(previous).await;
            let board = chain.get_daily_leaderboard(previous).await;
            match (pool, board) {
                (Ok(pool), Ok(board)) => {
                    tracker.publish_rollover(rollover_record(cycle_id, pool, board.first()));
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(cycle = previous, error = %e, "rollover inputs unavailable")
                }
            }
        }
    }

    for slip_id in tracker.unevaluated_slips() {
        match chain.get_slip_evaluation(slip_id).await {
            Ok(Some(evaluation)) => tracker.merge(SlipSignal::Chain(evaluation)),
            Ok(None) => debug!(slip = slip_id, "slip not yet evaluated"),
            Err(e) => warn!(slip = slip_id, error = %e, "slip evaluation read failed"),
        }
    }
}
