//! Prize-pool rollover arithmetic.
//!
//! When a cycle ends without a winner, its pool minus the protocol fee
//! carries into the next cycle. All math is U256 basis-point integer
//! arithmetic so the result never drifts from the on-chain fee computation.

use crate::chain::LeaderboardEntry;
use crate::slips::WIN_THRESHOLD;
use alloy_primitives::U256;

/// Protocol fee on carried-forward pools: 500 bps = 5%.
pub const ROLLOVER_FEE_BPS: u32 = 500;

const BPS_DENOMINATOR: u64 = 10_000;

/// Derived per cycle, recomputed on demand; never persisted client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRolloverRecord {
    pub cycle_id: u64,
    pub previous_prize_pool: U256,
    pub had_winner: bool,
    pub fee_bps: u32,
    pub rollover_amount: U256,
}

/// A cycle has a winner iff its top leaderboard entry exists and cleared the
/// win threshold.
pub fn cycle_has_winner(top: Option<&LeaderboardEntry>) -> bool {
    top.map_or(false, |entry| entry.correct_count >= WIN_THRESHOLD)
}

/// Pool carried into `cycle_id` from its predecessor. Zero for the first
/// cycle (no predecessor) and for any cycle whose predecessor paid out.
pub fn compute_rollover(
    cycle_id: u64,
    previous_pool_wei: U256,
    previous_top: Option<&LeaderboardEntry>,
) -> U256 {
    if cycle_id <= 1 {
        return U256::ZERO;
    }
    if cycle_has_winner(previous_top) {
        return U256::ZERO;
    }
    let fee = previous_pool_wei * U256::from(ROLLOVER_FEE_BPS) / U256::from(BPS_DENOMINATOR);
    previous_pool_wei - fee
}

pub fn rollover_record(
    cycle_id: u64,
    previous_pool_wei: U256,
    previous_top: Option<&LeaderboardEntry>,
) -> CycleRolloverRecord {
    CycleRolloverRecord {
        cycle_id,
        previous_prize_pool: previous_pool_wei,
        had_winner: cycle_has_winner(previous_top),
        fee_bps: ROLLOVER_FEE_BPS,
        rollover_amount: compute_rollover(cycle_id, previous_pool_wei, previous_top),
    }
}
