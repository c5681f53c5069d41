//! Time utilities for the match simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Default tick rate
pub const SIMULATION_TPS: u32 = 30; // 30 ticks per second

/// Tick budget in microseconds
pub fn tick_duration_micros(tick_rate: u32) -> u64 {
    1_000_000 / tick_rate.max(1) as u64
}

/// Calculate delta time for physics (in seconds)
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// Convert a duration in seconds to a whole number of simulation ticks
pub fn secs_to_ticks(secs: u32, tick_rate: u32) -> u64 {
    secs as u64 * tick_rate as u64
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_per_round() {
        assert_eq!(secs_to_ticks(60, SIMULATION_TPS), 1800);
        assert_eq!(secs_to_ticks(0, SIMULATION_TPS), 0);
    }

    #[test]
    fn test_tick_delta_matches_rate() {
        assert!((tick_delta(SIMULATION_TPS) * SIMULATION_TPS as f32 - 1.0).abs() < 1e-6);
        assert_eq!(tick_duration_micros(SIMULATION_TPS), 33_333);
    }
}
