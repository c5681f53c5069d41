//! Round and match progression
//!
//! A tick-counted state machine: the match loop calls [`RoundSystem::tick`]
//! once per simulation tick and every timer is a countdown of ticks, so the
//! whole progression can be driven deterministically in tests.
//!
//! ```text
//! Pending -> Active -> (elimination | timeout) -> Intermission -> Active -> ... -> Complete
//!                   \-> forfeit ------------------------------------------------> Complete
//! ```

use std::str::FromStr;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MatchConfig;

use super::state::GameStateManager;

/// Seconds remaining at which a time warning is announced
pub const TIME_WARNINGS: [u32; 3] = [30, 10, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Match created, first round not started yet
    Pending,
    Active,
    Intermission,
    Complete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub player1_wins: u32,
    pub player2_wins: u32,
}

/// How a timeout is decided when health and damage are identical
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreakPolicy {
    /// Player one takes the round
    PlayerOne,
    /// Seeded coin flip, reproducible from the match seed
    CoinFlip,
}

impl FromStr for TieBreakPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player_one" => Ok(Self::PlayerOne),
            "coin_flip" => Ok(Self::CoinFlip),
            other => Err(format!("unknown tie-break policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundEndReason {
    Elimination,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchEndReason {
    /// Win threshold or round cap reached
    Completed,
    /// A player left and did not come back
    Forfeit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round: u32,
    pub winner_id: Uuid,
    pub loser_id: Uuid,
    pub reason: RoundEndReason,
    pub duration_ms: u64,
    /// Score after this round
    pub score: Score,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: Uuid,
    pub winner_id: Uuid,
    pub loser_id: Uuid,
    pub final_score: Score,
    pub rounds: Vec<RoundResult>,
    pub duration_ms: u64,
    pub reason: MatchEndReason,
}

/// Lifecycle notifications produced by the round system
#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    RoundStarted { round: u32, duration_secs: u32 },
    TimeWarning { round: u32, seconds_remaining: u32 },
    RoundEnded(RoundResult),
    CountdownTick { next_round: u32, seconds_remaining: u32 },
    CountdownComplete { next_round: u32 },
    MatchCompleted(MatchResult),
}

/// Round/match state machine for one 1v1 match
pub struct RoundSystem {
    match_id: Uuid,
    player1_id: Uuid,
    player2_id: Uuid,
    tick_rate: u64,
    round_duration_secs: u32,
    intermission_secs: u32,
    wins_to_win_match: u32,
    max_rounds: u32,
    tie_break: TieBreakPolicy,
    rng: ChaCha8Rng,

    status: RoundStatus,
    current_round: u32,
    score: Score,
    results: Vec<RoundResult>,
    /// Ticks spent in the current phase (round or intermission)
    phase_ticks: u64,
    seconds_remaining: u32,
    match_ticks: u64,
    round_start_tick: u64,
    match_result: Option<MatchResult>,
    events: Vec<RoundEvent>,
}

impl RoundSystem {
    pub fn new(match_id: Uuid, player1_id: Uuid, player2_id: Uuid, config: &MatchConfig, seed: u64) -> Self {
        Self {
            match_id,
            player1_id,
            player2_id,
            tick_rate: config.tick_rate.max(1) as u64,
            round_duration_secs: config.round_duration_secs.max(1),
            intermission_secs: config.intermission_secs,
            wins_to_win_match: config.wins_to_win_match.max(1),
            max_rounds: config.max_rounds.max(1),
            tie_break: config.tie_break,
            rng: ChaCha8Rng::seed_from_u64(seed),
            status: RoundStatus::Pending,
            current_round: 0,
            score: Score::default(),
            results: Vec::new(),
            phase_ticks: 0,
            seconds_remaining: 0,
            match_ticks: 0,
            round_start_tick: 0,
            match_result: None,
            events: Vec::new(),
        }
    }

    pub fn status(&self) -> RoundStatus {
        self.status
    }

    pub fn is_complete(&self) -> bool {
        self.status == RoundStatus::Complete
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn score(&self) -> Score {
        self.score
    }

    pub fn seconds_remaining(&self) -> u32 {
        self.seconds_remaining
    }

    pub fn match_result(&self) -> Option<&MatchResult> {
        self.match_result.as_ref()
    }

    /// Take the lifecycle events produced since the last call
    pub fn drain_events(&mut self) -> Vec<RoundEvent> {
        std::mem::take(&mut self.events)
    }

    /// Begin round 1 immediately
    pub fn start_match(&mut self, state: &mut GameStateManager) {
        if self.status != RoundStatus::Pending {
            warn!(match_id = %self.match_id, status = ?self.status, "start_match called twice");
            return;
        }
        info!(match_id = %self.match_id, "Match starting");
        self.begin_round(1, state);
    }

    /// Advance timers by one simulation tick
    pub fn tick(&mut self, state: &mut GameStateManager) {
        match self.status {
            RoundStatus::Pending | RoundStatus::Complete => return,
            RoundStatus::Active | RoundStatus::Intermission => {}
        }

        self.match_ticks += 1;
        self.phase_ticks += 1;
        if self.phase_ticks % self.tick_rate != 0 {
            return;
        }

        self.seconds_remaining = self.seconds_remaining.saturating_sub(1);
        match self.status {
            RoundStatus::Active => {
                state.update_round_time(self.seconds_remaining);
                if self.seconds_remaining == 0 {
                    let winner = self.determine_timeout_winner(state);
                    self.end_round(winner, RoundEndReason::Timeout, state);
                } else if TIME_WARNINGS.contains(&self.seconds_remaining) {
                    self.events.push(RoundEvent::TimeWarning {
                        round: self.current_round,
                        seconds_remaining: self.seconds_remaining,
                    });
                }
            }
            RoundStatus::Intermission => {
                let next_round = self.current_round + 1;
                if self.seconds_remaining == 0 {
                    self.events.push(RoundEvent::CountdownComplete { next_round });
                    self.begin_round(next_round, state);
                } else {
                    self.events.push(RoundEvent::CountdownTick {
                        next_round,
                        seconds_remaining: self.seconds_remaining,
                    });
                }
            }
            RoundStatus::Pending | RoundStatus::Complete => {}
        }
    }

    /// A player died. The killer wins the round when known, otherwise the survivor.
    pub fn on_player_eliminated(&mut self, state: &mut GameStateManager, dead_id: Uuid, killer_id: Option<Uuid>) {
        if self.status != RoundStatus::Active {
            return;
        }
        let Some(survivor) = self.opponent_of(&dead_id) else {
            warn!(match_id = %self.match_id, player_id = %dead_id, "Elimination for unknown player");
            return;
        };
        let winner = match killer_id {
            Some(killer) if killer != dead_id && self.opponent_of(&killer).is_some() => killer,
            _ => survivor,
        };
        self.end_round(winner, RoundEndReason::Elimination, state);
    }

    /// A player left for good: the match ends at once in the opponent's favour
    pub fn on_player_disconnected(&mut self, state: &mut GameStateManager, player_id: Uuid) {
        if self.is_complete() {
            return;
        }
        let Some(winner) = self.opponent_of(&player_id) else {
            return;
        };
        info!(match_id = %self.match_id, player_id = %player_id, "Player forfeited by disconnect");
        self.complete_match(winner, MatchEndReason::Forfeit, state);
    }

    /// Pick the winner of a round that ran out of time.
    ///
    /// Higher health percentage wins, then more damage dealt this round, then
    /// the configured tie-break policy.
    pub fn determine_timeout_winner(&mut self, state: &GameStateManager) -> Uuid {
        let (Some(p1), Some(p2)) = (state.player(&self.player1_id), state.player(&self.player2_id)) else {
            warn!(match_id = %self.match_id, "Timeout with missing player state, defaulting to player one");
            return self.player1_id;
        };

        // Cross-multiply so equal fractions compare equal exactly
        let p1_health = p1.health.max(0) as i64 * p2.max_health.max(1) as i64;
        let p2_health = p2.health.max(0) as i64 * p1.max_health.max(1) as i64;
        if p1_health != p2_health {
            return if p1_health > p2_health { p1.id } else { p2.id };
        }
        if p1.round_damage_dealt != p2.round_damage_dealt {
            return if p1.round_damage_dealt > p2.round_damage_dealt { p1.id } else { p2.id };
        }

        match self.tie_break {
            TieBreakPolicy::PlayerOne => {
                info!(match_id = %self.match_id, round = self.current_round, "Exact timeout tie, awarding player one");
                self.player1_id
            }
            TieBreakPolicy::CoinFlip => {
                let winner = if self.rng.gen_bool(0.5) { self.player1_id } else { self.player2_id };
                info!(match_id = %self.match_id, round = self.current_round, winner_id = %winner, "Exact timeout tie, coin flip");
                winner
            }
        }
    }

    fn opponent_of(&self, player_id: &Uuid) -> Option<Uuid> {
        if player_id == &self.player1_id {
            Some(self.player2_id)
        } else if player_id == &self.player2_id {
            Some(self.player1_id)
        } else {
            None
        }
    }

    fn begin_round(&mut self, round: u32, state: &mut GameStateManager) {
        self.current_round = round;
        self.status = RoundStatus::Active;
        self.phase_ticks = 0;
        self.seconds_remaining = self.round_duration_secs;
        self.round_start_tick = self.match_ticks;
        state.start_round(round, self.round_duration_secs);

        info!(match_id = %self.match_id, round, "Round started");
        self.events.push(RoundEvent::RoundStarted {
            round,
            duration_secs: self.round_duration_secs,
        });
    }

    fn end_round(&mut self, winner_id: Uuid, reason: RoundEndReason, state: &mut GameStateManager) {
        let Some(loser_id) = self.opponent_of(&winner_id) else {
            return;
        };
        if winner_id == self.player1_id {
            self.score.player1_wins += 1;
        } else {
            self.score.player2_wins += 1;
        }

        let result = RoundResult {
            round: self.current_round,
            winner_id,
            loser_id,
            reason,
            duration_ms: self.ticks_to_ms(self.match_ticks - self.round_start_tick),
            score: self.score,
        };
        info!(
            match_id = %self.match_id,
            round = self.current_round,
            winner_id = %winner_id,
            reason = ?reason,
            player1_wins = self.score.player1_wins,
            player2_wins = self.score.player2_wins,
            "Round ended"
        );
        self.results.push(result.clone());
        self.events.push(RoundEvent::RoundEnded(result));
        state.end_round(self.score);

        let decided = self.score.player1_wins >= self.wins_to_win_match
            || self.score.player2_wins >= self.wins_to_win_match
            || self.current_round >= self.max_rounds;
        if decided {
            let match_winner = match self.score.player1_wins.cmp(&self.score.player2_wins) {
                std::cmp::Ordering::Greater => self.player1_id,
                std::cmp::Ordering::Less => self.player2_id,
                std::cmp::Ordering::Equal => winner_id,
            };
            self.complete_match(match_winner, MatchEndReason::Completed, state);
            return;
        }

        self.status = RoundStatus::Intermission;
        self.phase_ticks = 0;
        self.seconds_remaining = self.intermission_secs;
        if self.intermission_secs == 0 {
            let next_round = self.current_round + 1;
            self.events.push(RoundEvent::CountdownComplete { next_round });
            self.begin_round(next_round, state);
        } else {
            self.events.push(RoundEvent::CountdownTick {
                next_round: self.current_round + 1,
                seconds_remaining: self.intermission_secs,
            });
        }
    }

    fn complete_match(&mut self, winner_id: Uuid, reason: MatchEndReason, state: &mut GameStateManager) {
        if self.is_complete() {
            return;
        }
        let Some(loser_id) = self.opponent_of(&winner_id) else {
            return;
        };
        self.status = RoundStatus::Complete;

        let result = MatchResult {
            match_id: self.match_id,
            winner_id,
            loser_id,
            final_score: self.score,
            rounds: self.results.clone(),
            duration_ms: self.ticks_to_ms(self.match_ticks),
            reason,
        };
        info!(
            match_id = %self.match_id,
            winner_id = %winner_id,
            reason = ?reason,
            rounds = self.results.len(),
            "Match complete"
        );
        state.end_match(winner_id, self.score);
        self.match_result = Some(result.clone());
        self.events.push(RoundEvent::MatchCompleted(result));
    }

    fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks * 1000 / self.tick_rate
    }
}
