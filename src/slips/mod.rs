//! Slip state: the merge layer reconciling push events, enrichment
//! snapshots, and on-chain evaluation into one authoritative view per slip.
//!
//! Signal priority, highest first:
//!   1. on-chain evaluation (sticky; the only source allowed to decide
//!      win/loss counts once present)
//!   2. enrichment snapshots (descriptive fields; final correctness for
//!      finished matches only)
//!   3. live/poll data (provisional correctness for in-play matches)
//!
//! Merging is additive: a later partial payload never erases a field set by
//! an equal- or higher-priority source. Arrival order across the three
//! sources is not trustworthy, which is exactly why these rules exist.

pub mod status;

use crate::chain::ChainEvaluation;
use crate::decode::{decode, descale, BetType, DecodedPrediction, PushEvent, UNKNOWN_SELECTION};
use crate::enrichment::{ApiPrediction, ApiSlip};
use crate::rollover::CycleRolloverRecord;
use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use status::{derive_status, SlipStatus, WIN_THRESHOLD};

/// The merged, user-facing view of one slip. One instance per slip id,
/// mutated in place as signals arrive; never removed during a session, so a
/// stale slip stays visible with its last-known status.
#[derive(Debug, Clone)]
pub struct SlipView {
    pub slip_id: u64,
    pub cycle_id: u64,
    pub placed_at: Option<DateTime<Utc>>,
    pub predictions: Vec<DecodedPrediction>,
    pub correct_count: Option<u8>,
    pub final_score: Option<Decimal>,
    /// Sticky: once true, never reverts.
    pub is_evaluated_onchain: bool,
    /// Counts came from a direct on-chain read or settlement push, the
    /// highest-priority source; enrichment may no longer overwrite them.
    pub chain_evaluated: bool,
    pub cycle_resolved: bool,
    pub status: SlipStatus,
}

impl SlipView {
    pub fn new(slip_id: u64, cycle_id: u64) -> Self {
        Self {
            slip_id,
            cycle_id,
            placed_at: None,
            predictions: Vec::new(),
            correct_count: None,
            final_score: None,
            is_evaluated_onchain: false,
            chain_evaluated: false,
            cycle_resolved: false,
            status: SlipStatus::Pending,
        }
    }

    pub fn match_ids(&self) -> Vec<u64> {
        self.predictions.iter().map(|p| p.match_id).collect()
    }
}

/// One incoming signal for the merge pipeline.
#[derive(Debug, Clone)]
pub enum SlipSignal {
    /// Decoded push event from the real-time channel.
    Push(PushEvent),
    /// Enrichment-API snapshot for one slip.
    Snapshot(ApiSlip),
    /// Direct on-chain evaluation read.
    Chain(ChainEvaluation),
    /// Cycle resolution flag, from push or chain.
    Cycle { cycle_id: u64, resolved: bool },
}

/// Notifications emitted after each merge.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    SlipUpdated {
        slip_id: u64,
        status: SlipStatus,
    },
    CycleUpdated {
        cycle_id: u64,
        resolved: bool,
        prize_pool_wei: Option<U256>,
    },
    PrizeClaimed {
        slip_id: u64,
        amount_wei: Option<U256>,
    },
    CycleRollover(CycleRolloverRecord),
}

/// Keyed store of slip views plus the merge rules. Cheap to clone; all
/// clones share the same underlying map.
#[derive(Clone)]
pub struct SlipTracker {
    slips: Arc<DashMap<u64, SlipView>>,
    event_tx: mpsc::UnboundedSender<TrackerEvent>,
}

impl SlipTracker {
    pub fn new(event_tx: mpsc::UnboundedSender<TrackerEvent>) -> Self {
        Self {
            slips: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Apply one signal. Each call updates only the fields the signal
    /// actually carries, then recomputes the derived status.
    pub fn merge(&self, signal: SlipSignal) {
        match signal {
            SlipSignal::Push(event) => self.apply_push(event),
            SlipSignal::Snapshot(snapshot) => self.apply_snapshot(&snapshot),
            SlipSignal::Chain(eval) => {
                self.apply_evaluation(eval.slip_id, eval.correct_count, eval.final_score_scaled)
            }
            SlipSignal::Cycle { cycle_id, resolved } => self.apply_cycle(cycle_id, resolved),
        }
    }

    pub fn slip(&self, slip_id: u64) -> Option<SlipView> {
        self.slips.get(&slip_id).map(|v| v.clone())
    }

    pub fn all_slips(&self) -> Vec<SlipView> {
        self.slips.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Distinct cycles that still have unresolved slips; poll targets.
    pub fn unresolved_cycles(&self) -> Vec<u64> {
        let mut cycles: Vec<u64> = self
            .slips
            .iter()
            .filter(|entry| !entry.value().cycle_resolved)
            .map(|entry| entry.value().cycle_id)
            .collect();
        cycles.sort_unstable();
        cycles.dedup();
        cycles
    }

    /// Slips still waiting for on-chain settlement; poll targets.
    pub fn unevaluated_slips(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .slips
            .iter()
            .filter(|entry| !entry.value().is_evaluated_onchain)
            .map(|entry| entry.value().slip_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Publish a computed rollover record for prize-pool display.
    pub fn publish_rollover(&self, record: CycleRolloverRecord) {
        let _ = self.event_tx.send(TrackerEvent::CycleRollover(record));
    }

    fn touch(&self, view: &mut SlipView) {
        view.status = derive_status(view);
        let _ = self.event_tx.send(TrackerEvent::SlipUpdated {
            slip_id: view.slip_id,
            status: view.status,
        });
    }

    fn apply_push(&self, event: PushEvent) {
        match event {
            PushEvent::SlipPlaced {
                slip_id,
                cycle_id,
                placed_at,
                predictions,
            } => {
                let mut entry = self
                    .slips
                    .entry(slip_id)
                    .or_insert_with(|| SlipView::new(slip_id, cycle_id));
                let view = entry.value_mut();
                view.cycle_id = cycle_id;
                if view.placed_at.is_none() {
                    view.placed_at = placed_at;
                }
                // Re-delivery of the placed event must not duplicate legs.
                if view.predictions.is_empty() {
                    view.predictions = predictions.iter().map(decode).collect();
                }
                info!(
                    slip = slip_id,
                    cycle = cycle_id,
                    legs = view.predictions.len(),
                    "slip placed"
                );
                self.touch(view);
            }
            PushEvent::SlipEvaluated {
                slip_id,
                correct_count,
                final_score_scaled,
            } => self.apply_evaluation(slip_id, correct_count, final_score_scaled),
            PushEvent::EvaluationPending { slip_id } => {
                debug!(slip = slip_id, "slip not yet evaluated on-chain");
            }
            PushEvent::PrizeClaimed {
                slip_id,
                amount_wei,
            } => {
                let _ = self.event_tx.send(TrackerEvent::PrizeClaimed {
                    slip_id,
                    amount_wei,
                });
            }
            PushEvent::CycleUpdate {
                cycle_id,
                resolved,
                prize_pool_wei,
            } => {
                self.apply_cycle(cycle_id, resolved);
                let _ = self.event_tx.send(TrackerEvent::CycleUpdated {
                    cycle_id,
                    resolved,
                    prize_pool_wei,
                });
            }
            PushEvent::FixtureUpdate {
                match_id,
                home_score,
                away_score,
                status,
            } => self.apply_fixture(match_id, home_score, away_score, status.as_deref()),
        }
    }

    /// Highest-priority signal: settlement counts from the chain (directly
    /// or relayed by the settlement push). Sticky.
    fn apply_evaluation(&self, slip_id: u64, correct_count: u8, final_score_scaled: u64) {
        let mut entry = self
            .slips
            .entry(slip_id)
            // Evaluation can outrun the placed event; cycle id arrives later.
            .or_insert_with(|| SlipView::new(slip_id, 0));
        let view = entry.value_mut();
        view.is_evaluated_onchain = true;
        view.chain_evaluated = true;
        view.correct_count = Some(correct_count);
        view.final_score = Some(descale(final_score_scaled));
        info!(
            slip = slip_id,
            correct = correct_count,
            "slip evaluated on-chain"
        );
        self.touch(view);
    }

    fn apply_cycle(&self, cycle_id: u64, resolved: bool) {
        for mut entry in self.slips.iter_mut() {
            let view = entry.value_mut();
            if view.cycle_id != cycle_id {
                continue;
            }
            // Resolution is monotonic; a stale unresolved flag never
            // downgrades a resolved cycle.
            if resolved && !view.cycle_resolved {
                view.cycle_resolved = true;
                self.touch(view);
            }
        }
    }

    /// Enrichment snapshot: descriptive fields always; correctness is final
    /// for finished matches, provisional for in-play ones. Slip-level counts
    /// are accepted only from an evaluated snapshot, and never once a direct
    /// chain read has landed.
    fn apply_snapshot(&self, snapshot: &ApiSlip) {
        let mut entry = self
            .slips
            .entry(snapshot.slip_id)
            .or_insert_with(|| SlipView::new(snapshot.slip_id, snapshot.cycle_id));
        let view = entry.value_mut();

        if view.cycle_id == 0 {
            view.cycle_id = snapshot.cycle_id;
        }
        if view.placed_at.is_none() {
            view.placed_at = snapshot.placed_at;
        }
        if snapshot.cycle_resolved {
            view.cycle_resolved = true;
        }
        if snapshot.is_evaluated {
            view.is_evaluated_onchain = true;
            if !view.chain_evaluated {
                if let Some(count) = snapshot.correct_count {
                    view.correct_count = Some(count);
                }
                if let Some(score) = snapshot.final_score {
                    view.final_score = Some(score);
                }
            }
        }

        for api in &snapshot.predictions {
            let finished =
                api.actual_result.is_some() || api.match_status.as_deref() == Some("finished");
            match view
                .predictions
                .iter_mut()
                .find(|p| p.match_id == api.match_id)
            {
                Some(existing) => merge_api_prediction(existing, api, finished),
                None => {
                    let mut fresh = prediction_from_api(api);
                    merge_api_prediction(&mut fresh, api, finished);
                    view.predictions.push(fresh);
                }
            }
        }

        self.touch(view);
    }

    /// Live fixture push: lowest priority. Updates the running score and a
    /// provisional moneyline verdict, never anything already final.
    fn apply_fixture(&self, match_id: u64, home_score: u32, away_score: u32, status: Option<&str>) {
        let score = format!("{}-{}", home_score, away_score);
        debug!(
            fixture = match_id,
            score = %score,
            status = status.unwrap_or("live"),
            "fixture update"
        );
        for mut entry in self.slips.iter_mut() {
            let view = entry.value_mut();
            let mut touched = false;
            for prediction in view
                .predictions
                .iter_mut()
                .filter(|p| p.match_id == match_id)
            {
                prediction.current_score = Some(score.clone());
                if prediction.bet_type == BetType::Moneyline && !prediction.correctness_final {
                    prediction.is_correct =
                        Some(prediction.selection == moneyline_outcome(home_score, away_score));
                }
                touched = true;
            }
            if touched {
                self.touch(view);
            }
        }
    }
}

fn moneyline_outcome(home_score: u32, away_score: u32) -> &'static str {
    if home_score > away_score {
        "1"
    } else if home_score < away_score {
        "2"
    } else {
        "X"
    }
}

fn prediction_from_api(api: &ApiPrediction) -> DecodedPrediction {
    DecodedPrediction {
        match_id: api.match_id,
        bet_type: BetType::from_wire(api.bet_type.unwrap_or(u8::MAX)),
        selection: api
            .selection
            .clone()
            .unwrap_or_else(|| UNKNOWN_SELECTION.to_string()),
        decimal_odds: api.selected_odd.unwrap_or(Decimal::ZERO),
        home_team: None,
        away_team: None,
        league_name: None,
        is_correct: None,
        correctness_final: false,
        actual_result: None,
        current_score: None,
    }
}

/// Field-wise additive merge: only fields the snapshot actually carries are
/// written, and provisional data never overwrites final data.
fn merge_api_prediction(prediction: &mut DecodedPrediction, api: &ApiPrediction, finished: bool) {
    if let Some(home) = &api.home_team {
        prediction.home_team = Some(home.clone());
    }
    if let Some(away) = &api.away_team {
        prediction.away_team = Some(away.clone());
    }
    if let Some(league) = &api.league_name {
        prediction.league_name = Some(league.clone());
    }
    if let Some(score) = &api.current_score {
        prediction.current_score = Some(score.clone());
    }
    // The decoder degrades unknown hashes to "unknown"; the enrichment API
    // knows the human-readable selection and may repair it.
    if prediction.selection == UNKNOWN_SELECTION {
        if let Some(selection) = &api.selection {
            prediction.selection = selection.clone();
        }
    }

    if finished {
        if let Some(result) = &api.actual_result {
            prediction.actual_result = Some(result.clone());
        }
        if let Some(correct) = api.is_correct {
            prediction.is_correct = Some(correct);
            prediction.correctness_final = true;
        }
    } else if let Some(correct) = api.is_correct {
        if !prediction.correctness_final {
            prediction.is_correct = Some(correct);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::selection_hash;
    use crate::decode::RawPredictionTuple;
    use std::str::FromStr;

    fn tracker() -> (SlipTracker, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SlipTracker::new(tx), rx)
    }

    fn placed(slip_id: u64, cycle_id: u64, legs: usize) -> SlipSignal {
        let predictions = (0..legs)
            .map(|i| RawPredictionTuple {
                match_id: 100 + i as u64,
                bet_type: 0,
                selection_hash: selection_hash("1"),
                scaled_odds: 1570,
            })
            .collect();
        SlipSignal::Push(PushEvent::SlipPlaced {
            slip_id,
            cycle_id,
            placed_at: None,
            predictions,
        })
    }

    fn api_prediction(match_id: u64) -> ApiPrediction {
        ApiPrediction {
            match_id,
            bet_type: Some(0),
            selection: Some("1".to_string()),
            selected_odd: Some(Decimal::from_str("1.57").unwrap()),
            is_correct: None,
            actual_result: None,
            home_team: None,
            away_team: None,
            league_name: None,
            match_status: None,
            current_score: None,
        }
    }

    fn snapshot(slip_id: u64, cycle_id: u64, predictions: Vec<ApiPrediction>) -> ApiSlip {
        ApiSlip {
            slip_id,
            cycle_id,
            placed_at: None,
            predictions,
            is_evaluated: false,
            cycle_resolved: false,
            correct_count: None,
            final_score: None,
        }
    }

    #[test]
    fn test_placed_event_builds_view() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 10));

        let view = tracker.slip(1).unwrap();
        assert_eq!(view.cycle_id, 9);
        assert_eq!(view.predictions.len(), 10);
        assert_eq!(view.status, SlipStatus::Pending);
        assert_eq!(
            view.predictions[0].decimal_odds,
            Decimal::from_str("1.57").unwrap()
        );
    }

    #[test]
    fn test_placed_redelivery_is_idempotent() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 10));
        tracker.merge(placed(1, 9, 10));
        assert_eq!(tracker.slip(1).unwrap().predictions.len(), 10);
    }

    #[test]
    fn test_merge_is_additive_across_partial_payloads() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 1));

        let mut enriched = api_prediction(100);
        enriched.home_team = Some("Arsenal".to_string());
        enriched.away_team = Some("Spurs".to_string());
        enriched.league_name = Some("Premier League".to_string());
        tracker.merge(SlipSignal::Snapshot(snapshot(1, 9, vec![enriched])));

        // A later snapshot that lacks the descriptive fields must not erase
        // them.
        tracker.merge(SlipSignal::Snapshot(snapshot(1, 9, vec![api_prediction(100)])));

        let view = tracker.slip(1).unwrap();
        assert_eq!(view.predictions[0].home_team.as_deref(), Some("Arsenal"));
        assert_eq!(view.predictions[0].away_team.as_deref(), Some("Spurs"));
        assert_eq!(
            view.predictions[0].league_name.as_deref(),
            Some("Premier League")
        );
    }

    #[test]
    fn test_fixture_update_does_not_erase_enrichment() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 1));

        let mut enriched = api_prediction(100);
        enriched.home_team = Some("Arsenal".to_string());
        tracker.merge(SlipSignal::Snapshot(snapshot(1, 9, vec![enriched])));

        tracker.merge(SlipSignal::Push(PushEvent::FixtureUpdate {
            match_id: 100,
            home_score: 2,
            away_score: 0,
            status: Some("live".to_string()),
        }));

        let view = tracker.slip(1).unwrap();
        assert_eq!(view.predictions[0].home_team.as_deref(), Some("Arsenal"));
        assert_eq!(view.predictions[0].current_score.as_deref(), Some("2-0"));
        // Selection "1" with the home side ahead: provisionally correct.
        assert_eq!(view.predictions[0].is_correct, Some(true));
        assert!(!view.predictions[0].correctness_final);
    }

    #[test]
    fn test_live_signal_never_overwrites_final_correctness() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 1));

        let mut finished = api_prediction(100);
        finished.is_correct = Some(false);
        finished.actual_result = Some("0-2".to_string());
        finished.match_status = Some("finished".to_string());
        tracker.merge(SlipSignal::Snapshot(snapshot(1, 9, vec![finished])));

        // A stale live frame claiming the home side leads arrives late.
        tracker.merge(SlipSignal::Push(PushEvent::FixtureUpdate {
            match_id: 100,
            home_score: 1,
            away_score: 0,
            status: Some("live".to_string()),
        }));

        let view = tracker.slip(1).unwrap();
        assert_eq!(view.predictions[0].is_correct, Some(false));
        assert!(view.predictions[0].correctness_final);
    }

    #[test]
    fn test_unfinished_match_leaves_correctness_unset() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 1));

        let mut upcoming = api_prediction(100);
        upcoming.match_status = Some("upcoming".to_string());
        tracker.merge(SlipSignal::Snapshot(snapshot(1, 9, vec![upcoming])));

        // Never defaulted to false.
        assert_eq!(tracker.slip(1).unwrap().predictions[0].is_correct, None);
    }

    #[test]
    fn test_evaluated_flag_is_sticky() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 10));
        tracker.merge(SlipSignal::Cycle {
            cycle_id: 9,
            resolved: true,
        });
        tracker.merge(SlipSignal::Chain(ChainEvaluation {
            slip_id: 1,
            correct_count: 8,
            final_score_scaled: 125_500,
        }));
        assert_eq!(tracker.slip(1).unwrap().status, SlipStatus::Won);

        // A stale unevaluated snapshot arrives afterwards.
        let mut stale = snapshot(1, 9, vec![]);
        stale.is_evaluated = false;
        stale.correct_count = Some(3);
        tracker.merge(SlipSignal::Snapshot(stale));

        let view = tracker.slip(1).unwrap();
        assert!(view.is_evaluated_onchain);
        assert_eq!(view.correct_count, Some(8));
        assert_eq!(view.status, SlipStatus::Won);
    }

    #[test]
    fn test_enrichment_counts_never_downgrade_chain_counts() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 10));
        tracker.merge(SlipSignal::Chain(ChainEvaluation {
            slip_id: 1,
            correct_count: 7,
            final_score_scaled: 98_000,
        }));

        let mut relayed = snapshot(1, 9, vec![]);
        relayed.is_evaluated = true;
        relayed.correct_count = Some(6);
        tracker.merge(SlipSignal::Snapshot(relayed));

        assert_eq!(tracker.slip(1).unwrap().correct_count, Some(7));
    }

    #[test]
    fn test_snapshot_creates_slip_unseen_by_push() {
        let (tracker, _rx) = tracker();
        let mut api = api_prediction(300);
        api.home_team = Some("Lyon".to_string());
        tracker.merge(SlipSignal::Snapshot(snapshot(5, 11, vec![api])));

        let view = tracker.slip(5).unwrap();
        assert_eq!(view.cycle_id, 11);
        assert_eq!(view.predictions.len(), 1);
        assert_eq!(view.predictions[0].home_team.as_deref(), Some("Lyon"));
    }

    #[test]
    fn test_end_to_end_settlement_order() {
        // Slip placed in cycle 9 with 10 predictions, 6 provisionally
        // correct: must read live, never won, until the cycle resolves and
        // the on-chain count lands.
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 10));

        for match_id in 100..106 {
            tracker.merge(SlipSignal::Push(PushEvent::FixtureUpdate {
                match_id,
                home_score: 1,
                away_score: 0,
                status: Some("live".to_string()),
            }));
        }
        assert_eq!(tracker.slip(1).unwrap().status, SlipStatus::Live);

        tracker.merge(SlipSignal::Cycle {
            cycle_id: 9,
            resolved: true,
        });
        // Cycle closed but settlement not yet confirmed.
        assert_eq!(tracker.slip(1).unwrap().status, SlipStatus::Pending);

        tracker.merge(SlipSignal::Chain(ChainEvaluation {
            slip_id: 1,
            correct_count: 6,
            final_score_scaled: 45_200,
        }));
        let view = tracker.slip(1).unwrap();
        assert_eq!(view.status, SlipStatus::Lost);
        assert_eq!(view.final_score, Some(Decimal::from_str("45.2").unwrap()));
    }

    #[test]
    fn test_cycle_resolution_only_touches_its_cycle() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 2));
        tracker.merge(placed(2, 10, 2));

        tracker.merge(SlipSignal::Cycle {
            cycle_id: 9,
            resolved: true,
        });

        assert!(tracker.slip(1).unwrap().cycle_resolved);
        assert!(!tracker.slip(2).unwrap().cycle_resolved);
        assert_eq!(tracker.unresolved_cycles(), vec![10]);
    }

    #[test]
    fn test_tracker_emits_updates() {
        let (tracker, mut rx) = tracker();
        tracker.merge(placed(1, 9, 1));
        match rx.try_recv() {
            Ok(TrackerEvent::SlipUpdated { slip_id, status }) => {
                assert_eq!(slip_id, 1);
                assert_eq!(status, SlipStatus::Pending);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unevaluated_slips_listing() {
        let (tracker, _rx) = tracker();
        tracker.merge(placed(1, 9, 1));
        tracker.merge(placed(2, 9, 1));
        tracker.merge(SlipSignal::Chain(ChainEvaluation {
            slip_id: 1,
            correct_count: 2,
            final_score_scaled: 10_000,
        }));
        assert_eq!(tracker.unevaluated_slips(), vec![2]);
    }
}
