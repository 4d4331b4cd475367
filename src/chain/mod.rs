//! On-chain read interface.
//!
//! The chain is the authority on settlement. This module only defines the
//! typed call results and the seam the rest of the crate consumes; the RPC
//! implementation (and everything about signing) lives outside this crate.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain call failed: {0}")]
    Call(String),
}

/// `getCycleStatus(cycleId)`.
#[derive(Debug, Clone, Copy)]
pub struct CycleStatus {
    pub cycle_id: u64,
    pub resolved: bool,
    /// Unix seconds when the cycle closes for new slips.
    pub end_time: u64,
}

/// One slip's settlement record, absent until the evaluation transaction
/// confirms. `final_score` is a ×1000-scaled integer, like wire odds.
#[derive(Debug, Clone, Copy)]
pub struct ChainEvaluation {
    pub slip_id: u64,
    pub correct_count: u8,
    pub final_score_scaled: u64,
}

/// One row of `getDailyLeaderboard(cycleId)`, best first.
#[derive(Debug, Clone, Copy)]
pub struct LeaderboardEntry {
    pub player: Address,
    pub slip_id: u64,
    pub correct_count: u8,
    pub final_score_scaled: u64,
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_cycle_status(&self, cycle_id: u64) -> Result<CycleStatus, ChainError>;

    /// `None` while the slip has not been evaluated yet.
    async fn get_slip_evaluation(
        &self,
        slip_id: u64,
    ) -> Result<Option<ChainEvaluation>, ChainError>;

    async fn get_daily_leaderboard(
        &self,
        cycle_id: u64,
    ) -> Result<Vec<LeaderboardEntry>, ChainError>;

    /// `dailyPrizePools(cycleId)` in wei.
    async fn daily_prize_pool(&self, cycle_id: u64) -> Result<U256, ChainError>;

    /// Slip ids from `getUserSlipsWithData(user)`.
    async fn get_user_slip_ids(&self, user: Address) -> Result<Vec<u64>, ChainError>;
}
