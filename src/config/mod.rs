//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::game::round::TieBreakPolicy;
use crate::util::time::SIMULATION_TPS;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed CORS origins, comma separated
    pub client_origin: String,
    /// Rating/stats service endpoint; match outcomes are only logged when unset
    pub rating_service_url: Option<String>,
    /// Simulation tunables shared by every match
    pub match_config: MatchConfig,
}

/// Tunables for a single match simulation
#[derive(Clone, Debug)]
pub struct MatchConfig {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Round timer length
    pub round_duration_secs: u32,
    /// Pause between rounds
    pub intermission_secs: u32,
    /// Round wins needed to take the match
    pub wins_to_win_match: u32,
    /// Hard cap on rounds played
    pub max_rounds: u32,
    /// Force a full state sync at least this often
    pub full_sync_interval_ms: u64,
    /// Inputs whose client timestamp is older than this are dropped
    pub max_input_age_ms: u64,
    /// Minimum spacing between two inputs from the same player
    pub min_input_interval_ms: u64,
    /// Maximum facing change per tick (radians)
    pub max_turn_per_tick: f32,
    /// Maximum difference between attack direction and facing (radians)
    pub max_aim_deviation: f32,
    /// Movement inputs simulated per player per tick
    pub movement_inputs_per_tick: usize,
    /// Time a disconnected player has to come back before forfeiting
    pub disconnect_grace_secs: u32,
    /// How a timeout with identical health and damage is decided
    pub tie_break: TieBreakPolicy,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tick_rate: SIMULATION_TPS,
            round_duration_secs: 60,
            intermission_secs: 10,
            wins_to_win_match: 3,
            max_rounds: 5,
            full_sync_interval_ms: 5_000,
            max_input_age_ms: 1_000,
            min_input_interval_ms: 10,
            max_turn_per_tick: std::f32::consts::FRAC_PI_4,
            max_aim_deviation: 0.35,
            movement_inputs_per_tick: 2,
            disconnect_grace_secs: 10,
            tie_break: TieBreakPolicy::PlayerOne,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let defaults = MatchConfig::default();
        let match_config = MatchConfig {
            round_duration_secs: parse_or("ROUND_DURATION_SECS", defaults.round_duration_secs)?,
            intermission_secs: parse_or("INTERMISSION_SECS", defaults.intermission_secs)?,
            full_sync_interval_ms: parse_or("FULL_SYNC_INTERVAL_MS", defaults.full_sync_interval_ms)?,
            max_input_age_ms: parse_or("MAX_INPUT_AGE_MS", defaults.max_input_age_ms)?,
            min_input_interval_ms: parse_or("MIN_INPUT_INTERVAL_MS", defaults.min_input_interval_ms)?,
            disconnect_grace_secs: parse_or("DISCONNECT_GRACE_SECS", defaults.disconnect_grace_secs)?,
            tie_break: parse_or("TIMEOUT_TIEBREAK", defaults.tie_break)?,
            ..defaults
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            rating_service_url: env::var("RATING_SERVICE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),

            match_config,
        })
    }
}

/// Read an optional variable, falling back to `default` when it is unset
fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_match_config() {
        let config = MatchConfig::default();
        assert_eq!(config.tick_rate, 30);
        assert_eq!(config.wins_to_win_match, 3);
        assert_eq!(config.max_rounds, 5);
        assert_eq!(config.tie_break, TieBreakPolicy::PlayerOne);
    }

    #[test]
    fn test_parse_or_uses_default_when_unset() {
        let value: u32 = parse_or("ARENA_DUEL_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
