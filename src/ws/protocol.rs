//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use glam::Vec2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::collision::MapData;
use crate::game::delta::StatePayload;
use crate::game::round::{MatchResult, RoundResult};

/// Class archetypes available in the game
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassType {
    /// Fast arrows, light armor
    #[default]
    Archer,
    /// Slow homing bolts
    Mage,
    /// Short range hitscan with armor penetration
    Gunslinger,
    /// Heavy armor, piercing bolts
    Warden,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Movement intent for one client frame
    Movement {
        /// Sequence number for client-side prediction reconciliation
        sequence_id: u32,
        /// Client timestamp (Unix millis)
        timestamp: u64,
        data: MovementData,
    },

    /// Facing change
    Look {
        sequence_id: u32,
        timestamp: u64,
        data: LookData,
    },

    /// Weapon fire
    Attack {
        sequence_id: u32,
        timestamp: u64,
        data: AttackData,
    },

    /// Class ability activation
    Ability {
        sequence_id: u32,
        timestamp: u64,
        data: AbilityData,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },

    /// Ask for a full state sync (client detected a sequence gap)
    RequestResync {
        #[serde(default)]
        last_sequence: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MovementData {
    /// -1.0 = full backwards, 1.0 = full forward
    pub forward: f32,
    /// -1.0 = full left, 1.0 = full right
    pub strafe: f32,
    #[serde(default)]
    pub sprint: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LookData {
    /// Requested facing change in radians
    pub angle_delta: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackAction {
    PrimaryAttack,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttackData {
    pub action: AttackAction,
    /// Aim direction in radians
    pub direction: f32,
    #[serde(default)]
    pub target_position: Option<Vec2>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbilityData {
    #[serde(default)]
    pub slot: u8,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connecting to a match
    Welcome {
        player_id: Uuid,
        match_id: Uuid,
        server_time: u64,
        players: Vec<PlayerInfo>,
        map: MapData,
    },

    /// Per-tick state update (full sync or delta)
    State {
        payload: StatePayload,
        /// Highest input sequence the server applied for this client
        last_processed_input: u32,
    },

    /// A round has begun
    RoundStarted {
        match_id: Uuid,
        round: u32,
        duration_secs: u32,
    },

    /// Remaining round time crossed a warning threshold
    TimeWarning {
        match_id: Uuid,
        round: u32,
        seconds_remaining: u32,
    },

    /// A round has ended
    RoundEnded {
        match_id: Uuid,
        result: RoundResult,
    },

    /// Intermission countdown
    CountdownTick {
        match_id: Uuid,
        next_round: u32,
        seconds_remaining: u32,
    },

    /// Intermission finished, next round is about to start
    CountdownComplete {
        match_id: Uuid,
        next_round: u32,
    },

    /// The match has ended
    MatchEnded {
        match_id: Uuid,
        result: MatchResult,
    },

    /// Opponent connection state changed
    PlayerConnection {
        player_id: Uuid,
        connected: bool,
    },

    /// Error message
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
        server_time: u64,
    },
}

/// Player info for the welcome message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub player_id: Uuid,
    pub username: String,
    pub class_type: ClassType,
    pub rating: i32,
}

/// Transient game events, delivered once inside the next state payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    /// Hitscan shot resolved, for client tracer rendering
    HitscanFired {
        shooter_id: Uuid,
        start: Vec2,
        end: Vec2,
        hit_player_id: Option<Uuid>,
    },

    /// Damage applied to a player
    PlayerHit {
        attacker_id: Option<Uuid>,
        target_id: Uuid,
        damage: i32,
        position: Vec2,
    },

    /// Player died
    PlayerKilled {
        killer_id: Option<Uuid>,
        victim_id: Uuid,
    },

    /// Projectile stopped by a wall
    ProjectileImpact {
        projectile_id: u64,
        position: Vec2,
        wall_id: u32,
    },
}
