//! Enrichment API client.
//!
//! Resolves opaque on-chain identifiers into human-readable match data:
//! team names, league, results, and per-prediction correctness for finished
//! matches. Treated as a black box returning the structures below; a failed
//! fetch is retried on the next poll interval and never clears stale data.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PollError {
    #[error("enrichment request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chain read failed: {0}")]
    Chain(#[from] crate::chain::ChainError),
}

/// One slip as the enrichment API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSlip {
    pub slip_id: u64,
    pub cycle_id: u64,
    #[serde(default)]
    pub placed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predictions: Vec<ApiPrediction>,
    #[serde(default)]
    pub is_evaluated: bool,
    #[serde(default)]
    pub cycle_resolved: bool,
    #[serde(default)]
    pub correct_count: Option<u8>,
    #[serde(default)]
    pub final_score: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPrediction {
    pub match_id: u64,
    #[serde(default)]
    pub bet_type: Option<u8>,
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub selected_odd: Option<Decimal>,
    /// Present only once the API has a verdict; absent for matches it still
    /// considers open.
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub actual_result: Option<String>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub league_name: Option<String>,
    /// "upcoming" | "live" | "finished".
    #[serde(default)]
    pub match_status: Option<String>,
    #[serde(default)]
    pub current_score: Option<String>,
}

pub struct EnrichmentClient {
    http: reqwest::Client,
    base_url: String,
}

impl EnrichmentClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `GET /slips/{user}`: every slip the API knows for this address.
    pub async fn fetch_user_slips(&self, user: &Address) -> Result<Vec<ApiSlip>, PollError> {
        let url = format!("{}/slips/{:#x}", self.base_url, user);
        debug!(url = %url, "fetching enrichment snapshot");
        let response = self.http.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_api_slip_parses_wire_shape() {
        let json = r#"{
            "slip_id": 17,
            "cycle_id": 9,
            "predictions": [{
                "match_id": 100,
                "selection": "Over",
                "selected_odd": 1.85,
                "is_correct": true,
                "actual_result": "3-1",
                "home_team": "Ajax",
                "away_team": "PSV",
                "league_name": "Eredivisie",
                "match_status": "finished"
            }],
            "is_evaluated": false,
            "cycle_resolved": false,
            "correct_count": 4,
            "final_score": 12.5
        }"#;

        let slip: ApiSlip = serde_json::from_str(json).unwrap();
        assert_eq!(slip.slip_id, 17);
        assert_eq!(slip.cycle_id, 9);
        assert_eq!(slip.correct_count, Some(4));
        assert_eq!(slip.final_score, Some(Decimal::from_str("12.5").unwrap()));

        let p = &slip.predictions[0];
        assert_eq!(p.selection.as_deref(), Some("Over"));
        assert_eq!(p.selected_odd, Some(Decimal::from_str("1.85").unwrap()));
        assert_eq!(p.is_correct, Some(true));
        assert_eq!(p.home_team.as_deref(), Some("Ajax"));
    }

    #[test]
    fn test_sparse_prediction_defaults_to_none() {
        let p: ApiPrediction = serde_json::from_str(r#"{"match_id": 5}"#).unwrap();
        assert_eq!(p.is_correct, None);
        assert_eq!(p.home_team, None);
        assert_eq!(p.match_status, None);
    }
}
