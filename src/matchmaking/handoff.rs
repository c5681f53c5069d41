//! Completed-match handoff from the external matchmaker

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::collision::MapData;
use crate::ws::protocol::PlayerInfo;

/// Two paired players and the arena they will fight in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchHandoff {
    /// Matchmaker-assigned id; generated when absent
    #[serde(default)]
    pub match_id: Option<Uuid>,
    pub player1: PlayerInfo,
    pub player2: PlayerInfo,
    pub map: MapData,
}

impl MatchHandoff {
    /// Reject handoffs the simulation cannot run
    pub fn validate(&self) -> Result<(), HandoffError> {
        if self.player1.player_id == self.player2.player_id {
            return Err(HandoffError::SamePlayer(self.player1.player_id));
        }
        if !self.map.bounds.is_valid() {
            return Err(HandoffError::InvalidBounds);
        }
        if let Some(wall) = self
            .map
            .walls
            .iter()
            .find(|w| !(w.start.is_finite() && w.end.is_finite()))
        {
            return Err(HandoffError::InvalidWall(wall.id));
        }
        if let Some(points) = self.map.spawn_points {
            if points.iter().any(|p| !p.is_finite()) {
                return Err(HandoffError::InvalidSpawn);
            }
        }
        Ok(())
    }

    pub fn players(&self) -> [PlayerInfo; 2] {
        [self.player1.clone(), self.player2.clone()]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("Both slots hold player {0}")]
    SamePlayer(Uuid),

    #[error("Arena bounds are empty or not finite")]
    InvalidBounds,

    #[error("Wall {0} has non-finite geometry")]
    InvalidWall(u32),

    #[error("Spawn points must be finite")]
    InvalidSpawn,

    #[error("Match {0} already exists")]
    DuplicateMatch(Uuid),
}
