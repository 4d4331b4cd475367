//! Displayed slip status, derived fresh on every merge.
//!
//! The on-chain evaluation is the only authoritative source of win/loss:
//! live data can promote a pending slip to "live" for user feedback, but a
//! slip is never shown won or lost until its cycle has resolved AND the
//! settlement transaction is confirmed on-chain.

use crate::slips::SlipView;

/// Minimum correct predictions for a slip to qualify as a winner. Mirrors
/// the on-chain contract constant.
pub const WIN_THRESHOLD: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlipStatus {
    Pending,
    /// Pending, with at least one provisional in-play correctness signal.
    /// A UI refinement only; carries no settlement meaning.
    Live,
    Won,
    Lost,
}

impl std::fmt::Display for SlipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlipStatus::Pending => write!(f, "pending"),
            SlipStatus::Live => write!(f, "live"),
            SlipStatus::Won => write!(f, "won"),
            SlipStatus::Lost => write!(f, "lost"),
        }
    }
}

/// Pure function of the merged view. Handlers never set status directly.
pub fn derive_status(view: &SlipView) -> SlipStatus {
    if !view.cycle_resolved {
        // A slip cannot be decided while its cycle is open, even if every
        // visible match has finished.
        let any_provisional = view
            .predictions
            .iter()
            .any(|p| p.is_correct.is_some() && !p.correctness_final);
        return if any_provisional {
            SlipStatus::Live
        } else {
            SlipStatus::Pending
        };
    }

    if !view.is_evaluated_onchain {
        // Cycle closed but settlement not yet confirmed.
        return SlipStatus::Pending;
    }

    match view.correct_count {
        Some(count) if count >= WIN_THRESHOLD => SlipStatus::Won,
        _ => SlipStatus::Lost,
    }
}
