//! Wire-format decoding and normalization for channel push events.
//!
//! Prediction tuples arrive as compact arrays
//! `[matchId, betType, selectionHash, scaledOdds]`. Decoding is total: an
//! unknown selection hash falls back to `"unknown"`, an unknown bet-type
//! discriminant is preserved raw, and in both cases the rest of the tuple
//! stays usable. Odds always arrive pre-multiplied by 1000; the scaling
//! factor is a fixed wire contract, not a heuristic.

use alloy_primitives::{keccak256, FixedBytes, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

/// Wire odds divisor: `decimal_odds = scaled_odds / 1000`.
pub const ODDS_DIVISOR: u64 = 1000;

pub const UNKNOWN_SELECTION: &str = "unknown";

pub type SelectionHash = FixedBytes<4>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("malformed payload for {topic}: {source}")]
    Payload {
        topic: String,
        source: serde_json::Error,
    },
    #[error("bad id segment in topic {0}")]
    TopicId(String),
}

/// Bet market kinds carried in the wire tuple's second slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetType {
    Moneyline,
    OverUnder,
    BothTeamsScore,
    /// Discriminant this client does not know. Decoding still succeeds:
    /// selection and odds remain valid.
    Unknown(u8),
}

impl BetType {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => BetType::Moneyline,
            1 => BetType::OverUnder,
            2 => BetType::BothTeamsScore,
            other => BetType::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BetType::Moneyline => "moneyline",
            BetType::OverUnder => "over/under",
            BetType::BothTeamsScore => "both teams to score",
            BetType::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for BetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireTuple(u64, u8, String, u64);

/// A prediction exactly as it appears on the wire. Immutable, produced
/// externally.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireTuple")]
pub struct RawPredictionTuple {
    pub match_id: u64,
    pub bet_type: u8,
    pub selection_hash: SelectionHash,
    pub scaled_odds: u64,
}

impl From<WireTuple> for RawPredictionTuple {
    fn from(wire: WireTuple) -> Self {
        let WireTuple(match_id, bet_type, hash, scaled_odds) = wire;
        let selection_hash = hash.parse::<SelectionHash>().unwrap_or_else(|_| {
            warn!(hash = %hash, match_id = match_id, "unparseable selection hash");
            SelectionHash::ZERO
        });
        Self {
            match_id,
            bet_type,
            selection_hash,
            scaled_odds,
        }
    }
}

/// Outcome labels with fixed on-chain hashes: `bytes4(keccak256(label))`.
const SELECTION_LABELS: [&str; 7] = ["1", "X", "2", "Over", "Under", "Yes", "No"];

fn selection_table() -> &'static HashMap<SelectionHash, &'static str> {
    static TABLE: OnceLock<HashMap<SelectionHash, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SELECTION_LABELS
            .iter()
            .map(|label| {
                let digest = keccak256(label.as_bytes());
                (SelectionHash::from_slice(&digest[..4]), *label)
            })
            .collect()
    })
}

pub fn selection_label(hash: &SelectionHash) -> &'static str {
    selection_table().get(hash).copied().unwrap_or(UNKNOWN_SELECTION)
}

pub fn selection_hash(label: &str) -> SelectionHash {
    SelectionHash::from_slice(&keccak256(label.as_bytes())[..4])
}

/// A normalized prediction. Descriptive and correctness fields start empty
/// and are filled only by the merge pipeline, never by the decoder.
#[derive(Debug, Clone)]
pub struct DecodedPrediction {
    pub match_id: u64,
    pub bet_type: BetType,
    pub selection: String,
    pub decimal_odds: Decimal,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub league_name: Option<String>,
    /// `None` until some source confirms it. Never defaulted to `false`: an
    /// unconfirmed prediction must not read as wrong.
    pub is_correct: Option<bool>,
    /// True once `is_correct` came from a finished-match or settlement
    /// source; provisional live signals may no longer overwrite it.
    pub correctness_final: bool,
    pub actual_result: Option<String>,
    pub current_score: Option<String>,
}

/// Pure tuple decode: no network, no shared state.
pub fn decode(tuple: &RawPredictionTuple) -> DecodedPrediction {
    DecodedPrediction {
        match_id: tuple.match_id,
        bet_type: BetType::from_wire(tuple.bet_type),
        selection: selection_label(&tuple.selection_hash).to_string(),
        decimal_odds: Decimal::from(tuple.scaled_odds) / Decimal::from(ODDS_DIVISOR),
        home_team: None,
        away_team: None,
        league_name: None,
        is_correct: None,
        correctness_final: false,
        actual_result: None,
        current_score: None,
    }
}

/// Descale a ×1000 wire integer (odds, final scores) into a decimal.
pub fn descale(scaled: u64) -> Decimal {
    Decimal::from(scaled) / Decimal::from(ODDS_DIVISOR)
}

// --- Topic payload shapes ---

#[derive(Deserialize)]
struct SlipPlacedPayload {
    slip_id: u64,
    cycle_id: u64,
    #[serde(default)]
    placed_at: Option<DateTime<Utc>>,
    predictions: Vec<RawPredictionTuple>,
}

#[derive(Deserialize)]
struct SlipEvaluatedPayload {
    slip_id: u64,
    correct_count: u8,
    final_score: u64,
}

#[derive(Deserialize)]
struct PrizeClaimedPayload {
    slip_id: u64,
    #[serde(default)]
    amount: Option<String>,
}

#[derive(Deserialize)]
struct CyclePayload {
    cycle_id: u64,
    resolved: bool,
    #[serde(default)]
    prize_pool: Option<String>,
}

#[derive(Deserialize)]
struct EvaluationPayload {
    #[serde(default)]
    is_evaluated: bool,
    #[serde(default)]
    correct_count: u8,
    #[serde(default)]
    final_score: u64,
}

#[derive(Deserialize)]
struct FixturePayload {
    home_score: u32,
    away_score: u32,
    #[serde(default)]
    status: Option<String>,
}

/// Tagged union over everything the push channel can deliver, keyed by topic
/// shape. Consumers match exhaustively.
#[derive(Debug, Clone)]
pub enum PushEvent {
    SlipPlaced {
        slip_id: u64,
        cycle_id: u64,
        placed_at: Option<DateTime<Utc>>,
        predictions: Vec<RawPredictionTuple>,
    },
    SlipEvaluated {
        slip_id: u64,
        correct_count: u8,
        final_score_scaled: u64,
    },
    PrizeClaimed {
        slip_id: u64,
        amount_wei: Option<U256>,
    },
    CycleUpdate {
        cycle_id: u64,
        resolved: bool,
        prize_pool_wei: Option<U256>,
    },
    FixtureUpdate {
        match_id: u64,
        home_score: u32,
        away_score: u32,
        status: Option<String>,
    },
    /// Evaluation-topic tick for a slip not yet settled on-chain. Carries no
    /// merge-worthy data; the evaluated flag is sticky and never reverts.
    EvaluationPending { slip_id: u64 },
}

impl PushEvent {
    /// Decode an update's payload according to its topic. Unknown topics and
    /// malformed payloads fail with a `DecodeError` the caller logs and
    /// drops; they never take the dispatch pipeline down.
    pub fn from_topic(topic: &str, data: &Value) -> Result<PushEvent, DecodeError> {
        if topic.starts_with("slip:placed:user:") || topic.starts_with("slips:user:") {
            let payload: SlipPlacedPayload = parse_payload(topic, data)?;
            return Ok(PushEvent::SlipPlaced {
                slip_id: payload.slip_id,
                cycle_id: payload.cycle_id,
                placed_at: payload.placed_at,
                predictions: payload.predictions,
            });
        }

        if topic.starts_with("slip:evaluated:user:") {
            let payload: SlipEvaluatedPayload = parse_payload(topic, data)?;
            return Ok(PushEvent::SlipEvaluated {
                slip_id: payload.slip_id,
                correct_count: payload.correct_count,
                final_score_scaled: payload.final_score,
            });
        }

        if topic.starts_with("slip:prize_claimed:user:") {
            let payload: PrizeClaimedPayload = parse_payload(topic, data)?;
            return Ok(PushEvent::PrizeClaimed {
                slip_id: payload.slip_id,
                amount_wei: payload.amount.as_deref().and_then(parse_wei),
            });
        }

        if topic.starts_with("oddyssey:cycle:") {
            let payload: CyclePayload = parse_payload(topic, data)?;
            return Ok(PushEvent::CycleUpdate {
                cycle_id: payload.cycle_id,
                resolved: payload.resolved,
                prize_pool_wei: payload.prize_pool.as_deref().and_then(parse_wei),
            });
        }

        if let Some(rest) = topic.strip_prefix("oddyssey:slip:") {
            if let Some(id) = rest.strip_suffix(":evaluation") {
                let slip_id = id
                    .parse::<u64>()
                    .map_err(|_| DecodeError::TopicId(topic.to_string()))?;
                let payload: EvaluationPayload = parse_payload(topic, data)?;
                if !payload.is_evaluated {
                    return Ok(PushEvent::EvaluationPending { slip_id });
                }
                return Ok(PushEvent::SlipEvaluated {
                    slip_id,
                    correct_count: payload.correct_count,
                    final_score_scaled: payload.final_score,
                });
            }
        }

        if let Some(id) = topic.strip_prefix("fixture:") {
            let match_id = id
                .parse::<u64>()
                .map_err(|_| DecodeError::TopicId(topic.to_string()))?;
            let payload: FixturePayload = parse_payload(topic, data)?;
            return Ok(PushEvent::FixtureUpdate {
                match_id,
                home_score: payload.home_score,
                away_score: payload.away_score,
                status: payload.status,
            });
        }

        Err(DecodeError::UnknownTopic(topic.to_string()))
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    topic: &str,
    data: &Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(data.clone()).map_err(|source| DecodeError::Payload {
        topic: topic.to_string(),
        source,
    })
}

fn parse_wei(raw: &str) -> Option<U256> {
    match raw.parse::<U256>() {
        Ok(amount) => Some(amount),
        Err(e) => {
            warn!(raw = raw, error = %e, "unparseable wei amount");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn tuple(selection: &str, scaled_odds: u64) -> RawPredictionTuple {
        RawPredictionTuple {
            match_id: 101,
            bet_type: 0,
            selection_hash: selection_hash(selection),
            scaled_odds,
        }
    }

    #[test]
    fn test_odds_descaling() {
        let decoded = decode(&tuple("1", 1570));
        assert_eq!(decoded.decimal_odds, Decimal::from_str("1.57").unwrap());

        let decoded = decode(&tuple("Over", 3000));
        assert_eq!(decoded.decimal_odds, Decimal::from_str("3").unwrap());
    }

    #[test]
    fn test_known_selections_decode() {
        for label in SELECTION_LABELS {
            let decoded = decode(&RawPredictionTuple {
                match_id: 1,
                bet_type: 0,
                selection_hash: selection_hash(label),
                scaled_odds: 2000,
            });
            assert_eq!(decoded.selection, label);
        }
    }

    #[test]
    fn test_unknown_selection_hash_is_total() {
        let decoded = decode(&RawPredictionTuple {
            match_id: 9,
            bet_type: 1,
            selection_hash: SelectionHash::from([0xde, 0xad, 0xbe, 0xef]),
            scaled_odds: 2250,
        });
        // Partial information beats none: selection degrades, the rest holds.
        assert_eq!(decoded.selection, UNKNOWN_SELECTION);
        assert_eq!(decoded.bet_type, BetType::OverUnder);
        assert_eq!(decoded.decimal_odds, Decimal::from_str("2.25").unwrap());
    }

    #[test]
    fn test_unknown_bet_type_is_preserved() {
        assert_eq!(BetType::from_wire(7), BetType::Unknown(7));
        assert_eq!(BetType::from_wire(7).label(), "unknown");
    }

    #[test]
    fn test_decoder_never_invents_enrichment() {
        let decoded = decode(&tuple("X", 3400));
        assert!(decoded.home_team.is_none());
        assert!(decoded.is_correct.is_none());
        assert!(!decoded.correctness_final);
        assert!(decoded.actual_result.is_none());
    }

    #[test]
    fn test_tuple_deserializes_from_wire_array() {
        let raw: RawPredictionTuple =
            serde_json::from_str(&format!(r#"[88, 1, "{}", 1950]"#, selection_hash("Under")))
                .unwrap();
        assert_eq!(raw.match_id, 88);
        assert_eq!(raw.bet_type, 1);
        assert_eq!(raw.selection_hash, selection_hash("Under"));
        assert_eq!(raw.scaled_odds, 1950);
    }

    #[test]
    fn test_bad_hash_degrades_to_zero() {
        let raw: RawPredictionTuple =
            serde_json::from_str(r#"[88, 1, "nonsense", 1950]"#).unwrap();
        assert_eq!(raw.selection_hash, SelectionHash::ZERO);
        assert_eq!(decode(&raw).selection, UNKNOWN_SELECTION);
    }

    #[test]
    fn test_slip_placed_from_topic() {
        let data = serde_json::json!({
            "slip_id": 4,
            "cycle_id": 9,
            "predictions": [[11, 0, selection_hash("1").to_string(), 1570]],
        });
        let event = PushEvent::from_topic("slip:placed:user:0xabc", &data).unwrap();
        match event {
            PushEvent::SlipPlaced {
                slip_id,
                cycle_id,
                predictions,
                ..
            } => {
                assert_eq!(slip_id, 4);
                assert_eq!(cycle_id, 9);
                assert_eq!(predictions.len(), 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_evaluation_topic_carries_slip_id() {
        let data = serde_json::json!({
            "is_evaluated": true,
            "correct_count": 8,
            "final_score": 125_500u64,
        });
        let event = PushEvent::from_topic("oddyssey:slip:42:evaluation", &data).unwrap();
        match event {
            PushEvent::SlipEvaluated {
                slip_id,
                correct_count,
                final_score_scaled,
            } => {
                assert_eq!(slip_id, 42);
                assert_eq!(correct_count, 8);
                assert_eq!(final_score_scaled, 125_500);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_topic_is_rejected_without_panic() {
        let err = PushEvent::from_topic("leaderboard:global", &serde_json::json!({}));
        assert!(matches!(err, Err(DecodeError::UnknownTopic(_))));
    }

    #[test]
    fn test_malformed_payload_is_an_error_not_a_panic() {
        let err = PushEvent::from_topic("fixture:3", &serde_json::json!({"home_score": "x"}));
        assert!(matches!(err, Err(DecodeError::Payload { .. })));
    }

    #[test]
    fn test_cycle_update_parses_pool() {
        let data = serde_json::json!({
            "cycle_id": 12,
            "resolved": true,
            "prize_pool": "5000000000000000000",
        });
        let event = PushEvent::from_topic("oddyssey:cycle:12", &data).unwrap();
        match event {
            PushEvent::CycleUpdate {
                cycle_id,
                resolved,
                prize_pool_wei,
            } => {
                assert_eq!(cycle_id, 12);
                assert!(resolved);
                assert_eq!(prize_pool_wei, Some(U256::from(5_000_000_000_000_000_000u64)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
