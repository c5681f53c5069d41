//! Match outcome notification for the external rating/stats service
//!
//! The server never computes rating changes. When a match completes it posts
//! the outcome and forgets about it.

use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::game::round::{MatchEndReason, MatchResult, RoundResult, Score};
use crate::game::state::PlayerState;

/// Per-player line of a finished match
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerOutcome {
    pub player_id: Uuid,
    pub rating: i32,
    pub kills: u32,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    pub shots_fired: u32,
    pub shots_hit: u32,
}

impl From<&PlayerState> for PlayerOutcome {
    fn from(player: &PlayerState) -> Self {
        Self {
            player_id: player.id,
            rating: player.rating,
            kills: player.kills,
            damage_dealt: player.damage_dealt,
            damage_taken: player.damage_taken,
            shots_fired: player.shots_fired,
            shots_hit: player.shots_hit,
        }
    }
}

/// Body posted to the rating service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub match_id: Uuid,
    pub winner_id: Uuid,
    pub loser_id: Uuid,
    pub duration_ms: u64,
    pub round_results: Vec<RoundResult>,
    pub final_score: Score,
    pub reason: MatchEndReason,
    pub players: Vec<PlayerOutcome>,
}

impl MatchOutcome {
    pub fn new(result: &MatchResult, players: &[PlayerState]) -> Self {
        Self {
            match_id: result.match_id,
            winner_id: result.winner_id,
            loser_id: result.loser_id,
            duration_ms: result.duration_ms,
            round_results: result.rounds.clone(),
            final_score: result.final_score,
            reason: result.reason,
            players: players.iter().map(PlayerOutcome::from).collect(),
        }
    }
}

/// Receives finished matches. Implementations must not block the caller.
pub trait MatchResultSink: Send + Sync {
    fn submit(&self, outcome: MatchOutcome);
}

/// Posts outcomes to the rating service on a background task
#[derive(Clone)]
pub struct HttpRatingReporter {
    client: Client,
    url: String,
}

impl HttpRatingReporter {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    async fn post(client: &Client, url: &str, outcome: &MatchOutcome) -> Result<(), RatingError> {
        let response = client.post(url).json(outcome).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RatingError::Api { status, body });
        }
        Ok(())
    }
}

impl MatchResultSink for HttpRatingReporter {
    fn submit(&self, outcome: MatchOutcome) {
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match Self::post(&client, &url, &outcome).await {
                Ok(()) => info!(match_id = %outcome.match_id, "Match outcome delivered to rating service"),
                Err(e) => warn!(match_id = %outcome.match_id, error = %e, "Rating service notification failed"),
            }
        });
    }
}

/// Used when no rating service is configured
pub struct LogRatingReporter;

impl MatchResultSink for LogRatingReporter {
    fn submit(&self, outcome: MatchOutcome) {
        info!(
            match_id = %outcome.match_id,
            winner_id = %outcome.winner_id,
            duration_ms = outcome.duration_ms,
            rounds = outcome.round_results.len(),
            "Match outcome (no rating service configured)"
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rating service error (status {status}): {body}")]
    Api { status: u16, body: String },
}
