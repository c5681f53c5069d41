//! Differential state replication
//!
//! Each match keeps exactly one previous snapshot and a sequence counter.
//! Every tick produces either a delta against that snapshot or an absolute
//! full sync; both are stamped with a strictly increasing sequence and the
//! sequence they are based on, so receivers can detect gaps and ask for a
//! resync.
//!
//! Positions and rotations are quantized before they are compared and before
//! they are sent. Client and server therefore agree on what "unchanged" means
//! and float jitter never produces traffic.

use std::collections::BTreeMap;
use std::f32::consts::TAU;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::ws::protocol::{ClassType, GameEvent};

use super::combat::ProjectileKind;
use super::round::{RoundStatus, Score};
use super::state::{GameState, PlayerState, RoundInfo};
use super::projectile::Projectile;

/// Positions are sent in hundredths of a world unit
pub const POSITION_PRECISION: f32 = 100.0;
/// Rotations snap to TAU / ROTATION_STEPS
pub const ROTATION_STEPS: f32 = 1024.0;

pub fn quantize_position(value: f32) -> f32 {
    (value * POSITION_PRECISION).round() / POSITION_PRECISION
}

/// Normalize into [0, TAU) and snap to the angular grid
pub fn quantize_rotation(angle: f32) -> f32 {
    let step = TAU / ROTATION_STEPS;
    let steps = (angle.rem_euclid(TAU) / step).round();
    if steps >= ROTATION_STEPS {
        0.0
    } else {
        steps * step
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub username: String,
    pub class_type: ClassType,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub rotation: f32,
    pub health: i32,
    pub max_health: i32,
    pub armor: f32,
    pub is_alive: bool,
    pub connected: bool,
    /// Advisory only, the server checks cooldowns itself
    pub weapon_ready_at: u64,
}

impl PlayerSnapshot {
    pub fn from_player(player: &PlayerState) -> Self {
        Self {
            id: player.id,
            username: player.username.clone(),
            class_type: player.class_type,
            x: quantize_position(player.position.x),
            y: quantize_position(player.position.y),
            vx: quantize_position(player.velocity.x),
            vy: quantize_position(player.velocity.y),
            rotation: quantize_rotation(player.rotation),
            health: player.health,
            max_health: player.max_health,
            armor: player.armor,
            is_alive: player.is_alive,
            connected: player.connected,
            weapon_ready_at: player.weapon_ready_at,
        }
    }

    /// Rebuild a player from a delta that carries every field
    fn from_delta(delta: &PlayerDelta) -> Option<Self> {
        Some(Self {
            id: delta.id,
            username: delta.username.clone()?,
            class_type: delta.class_type?,
            x: delta.x?,
            y: delta.y?,
            vx: delta.vx?,
            vy: delta.vy?,
            rotation: delta.rotation?,
            health: delta.health?,
            max_health: delta.max_health?,
            armor: delta.armor?,
            is_alive: delta.is_alive?,
            connected: delta.connected?,
            weapon_ready_at: delta.weapon_ready_at?,
        })
    }
}

/// Changed player fields; absent fields are unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerDelta {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_type: Option<ClassType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vx: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vy: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_health: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armor: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_alive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weapon_ready_at: Option<u64>,
}

impl PlayerDelta {
    fn complete(snapshot: &PlayerSnapshot) -> Self {
        Self {
            id: snapshot.id,
            username: Some(snapshot.username.clone()),
            class_type: Some(snapshot.class_type),
            x: Some(snapshot.x),
            y: Some(snapshot.y),
            vx: Some(snapshot.vx),
            vy: Some(snapshot.vy),
            rotation: Some(snapshot.rotation),
            health: Some(snapshot.health),
            max_health: Some(snapshot.max_health),
            armor: Some(snapshot.armor),
            is_alive: Some(snapshot.is_alive),
            connected: Some(snapshot.connected),
            weapon_ready_at: Some(snapshot.weapon_ready_at),
        }
    }

    /// Fields of `current` that differ from `previous`, or `None` when nothing changed
    fn between(previous: &PlayerSnapshot, current: &PlayerSnapshot) -> Option<Self> {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }

        let delta = Self {
            id: current.id,
            username: changed(&previous.username, &current.username),
            class_type: changed(&previous.class_type, &current.class_type),
            x: changed(&previous.x, &current.x),
            y: changed(&previous.y, &current.y),
            vx: changed(&previous.vx, &current.vx),
            vy: changed(&previous.vy, &current.vy),
            rotation: changed(&previous.rotation, &current.rotation),
            health: changed(&previous.health, &current.health),
            max_health: changed(&previous.max_health, &current.max_health),
            armor: changed(&previous.armor, &current.armor),
            is_alive: changed(&previous.is_alive, &current.is_alive),
            connected: changed(&previous.connected, &current.connected),
            weapon_ready_at: changed(&previous.weapon_ready_at, &current.weapon_ready_at),
        };
        (delta != Self { id: current.id, ..Self::default() }).then_some(delta)
    }

    fn apply_to(&self, player: &mut PlayerSnapshot) {
        if let Some(username) = &self.username {
            player.username = username.clone();
        }
        if let Some(v) = self.class_type {
            player.class_type = v;
        }
        if let Some(v) = self.x {
            player.x = v;
        }
        if let Some(v) = self.y {
            player.y = v;
        }
        if let Some(v) = self.vx {
            player.vx = v;
        }
        if let Some(v) = self.vy {
            player.vy = v;
        }
        if let Some(v) = self.rotation {
            player.rotation = v;
        }
        if let Some(v) = self.health {
            player.health = v;
        }
        if let Some(v) = self.max_health {
            player.max_health = v;
        }
        if let Some(v) = self.armor {
            player.armor = v;
        }
        if let Some(v) = self.is_alive {
            player.is_alive = v;
        }
        if let Some(v) = self.connected {
            player.connected = v;
        }
        if let Some(v) = self.weapon_ready_at {
            player.weapon_ready_at = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectileSnapshot {
    pub id: u64,
    pub owner_id: Uuid,
    pub kind: ProjectileKind,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,
}

impl ProjectileSnapshot {
    pub fn from_projectile(projectile: &Projectile) -> Self {
        Self {
            id: projectile.id,
            owner_id: projectile.owner_id,
            kind: projectile.kind,
            x: quantize_position(projectile.position.x),
            y: quantize_position(projectile.position.y),
            vx: quantize_position(projectile.velocity.x),
            vy: quantize_position(projectile.velocity.y),
            target_id: projectile.target_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProjectileDelta {
    Create(ProjectileSnapshot),
    Update {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        x: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        y: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        vx: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        vy: Option<f32>,
    },
    Destroy {
        id: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub round: u32,
    pub time_left: u32,
    pub status: RoundStatus,
    pub score: Score,
}

impl From<&RoundInfo> for RoundSnapshot {
    fn from(info: &RoundInfo) -> Self {
        Self {
            round: info.round,
            time_left: info.time_left,
            status: info.status,
            score: info.score,
        }
    }
}

/// Absolute, self-contained match state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullGameState {
    pub match_id: Uuid,
    pub sequence: u64,
    /// Sequence of the snapshot this one supersedes, if any
    pub based_on: Option<u64>,
    pub timestamp: u64,
    pub players: Vec<PlayerSnapshot>,
    pub projectiles: Vec<ProjectileSnapshot>,
    pub round: RoundSnapshot,
    pub winner_id: Option<Uuid>,
    pub events: Vec<GameEvent>,
}

/// Changes since the snapshot with sequence `based_on`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStateDelta {
    pub match_id: Uuid,
    pub sequence: u64,
    pub based_on: u64,
    pub timestamp: u64,
    pub players: Vec<PlayerDelta>,
    pub projectiles: Vec<ProjectileDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<Uuid>,
    pub events: Vec<GameEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatePayload {
    Full(FullGameState),
    Delta(GameStateDelta),
}

impl StatePayload {
    pub fn sequence(&self) -> u64 {
        match self {
            Self::Full(full) => full.sequence,
            Self::Delta(delta) => delta.sequence,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Quantized copy of everything replicated, kept between ticks
#[derive(Debug, Clone)]
struct StateSnapshot {
    sequence: u64,
    players: Vec<PlayerSnapshot>,
    projectiles: BTreeMap<u64, ProjectileSnapshot>,
    round: RoundSnapshot,
    winner_id: Option<Uuid>,
}

impl StateSnapshot {
    fn capture(state: &GameState, sequence: u64) -> Self {
        Self {
            sequence,
            players: state.players.iter().map(PlayerSnapshot::from_player).collect(),
            projectiles: state
                .projectiles
                .values()
                .filter(|p| p.active)
                .map(|p| (p.id, ProjectileSnapshot::from_projectile(p)))
                .collect(),
            round: RoundSnapshot::from(&state.round),
            winner_id: state.winner_id,
        }
    }

    fn to_full(&self, match_id: Uuid, based_on: Option<u64>, timestamp: u64, events: Vec<GameEvent>) -> FullGameState {
        FullGameState {
            match_id,
            sequence: self.sequence,
            based_on,
            timestamp,
            players: self.players.clone(),
            projectiles: self.projectiles.values().cloned().collect(),
            round: self.round,
            winner_id: self.winner_id,
            events,
        }
    }

    fn diff(&self, previous: &StateSnapshot, match_id: Uuid, timestamp: u64, events: Vec<GameEvent>) -> GameStateDelta {
        let players = self
            .players
            .iter()
            .filter_map(|current| match previous.players.iter().find(|p| p.id == current.id) {
                Some(old) => PlayerDelta::between(old, current),
                None => Some(PlayerDelta::complete(current)),
            })
            .collect();

        let mut projectiles = Vec::new();
        for (id, current) in &self.projectiles {
            match previous.projectiles.get(id) {
                None => projectiles.push(ProjectileDelta::Create(current.clone())),
                Some(old) if old != current => projectiles.push(ProjectileDelta::Update {
                    id: *id,
                    x: (old.x != current.x).then_some(current.x),
                    y: (old.y != current.y).then_some(current.y),
                    vx: (old.vx != current.vx).then_some(current.vx),
                    vy: (old.vy != current.vy).then_some(current.vy),
                }),
                Some(_) => {}
            }
        }
        for id in previous.projectiles.keys() {
            if !self.projectiles.contains_key(id) {
                projectiles.push(ProjectileDelta::Destroy { id: *id });
            }
        }

        GameStateDelta {
            match_id,
            sequence: self.sequence,
            based_on: previous.sequence,
            timestamp,
            players,
            projectiles,
            round: (self.round != previous.round).then_some(self.round),
            winner_id: if self.winner_id != previous.winner_id { self.winner_id } else { None },
            events,
        }
    }
}

#[derive(Debug, Default)]
struct MatchDeltaState {
    previous: Option<StateSnapshot>,
    sequence: u64,
    last_full_sync_at: u64,
    force_full: bool,
}

/// Per-match replication bookkeeping.
///
/// Entries are only touched by their own match loop; the map is concurrent
/// because match loops share worker threads.
pub struct DeltaStateManager {
    matches: DashMap<Uuid, MatchDeltaState>,
    full_sync_interval_ms: u64,
}

impl DeltaStateManager {
    pub fn new(full_sync_interval_ms: u64) -> Self {
        Self {
            matches: DashMap::new(),
            full_sync_interval_ms,
        }
    }

    /// Build the payload for this tick and make it the new baseline
    pub fn generate_delta(&self, state: &GameState, events: Vec<GameEvent>, now: u64) -> StatePayload {
        let mut entry = self.matches.entry(state.match_id).or_default();
        entry.sequence += 1;
        let current = StateSnapshot::capture(state, entry.sequence);

        let full_due = entry.force_full || now.saturating_sub(entry.last_full_sync_at) >= self.full_sync_interval_ms;
        let payload = match entry.previous.take() {
            Some(previous) if !full_due => {
                StatePayload::Delta(current.diff(&previous, state.match_id, now, events))
            }
            previous => {
                debug!(match_id = %state.match_id, sequence = current.sequence, "Full state sync");
                entry.last_full_sync_at = now;
                entry.force_full = false;
                StatePayload::Full(current.to_full(state.match_id, previous.map(|p| p.sequence), now, events))
            }
        };

        entry.previous = Some(current);
        payload
    }

    /// Make the next payload for this match a full sync
    pub fn request_full_sync(&self, match_id: Uuid) {
        self.matches.entry(match_id).or_default().force_full = true;
    }

    /// Last sequence handed out for a match
    pub fn current_sequence(&self, match_id: &Uuid) -> Option<u64> {
        self.matches.get(match_id).map(|entry| entry.sequence)
    }

    pub fn remove_match(&self, match_id: &Uuid) {
        self.matches.remove(match_id);
    }

}

// ============================================================================
// Receiver side
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeltaError {
    #[error("Delta based on {based_on} but replica is at {current:?}")]
    SequenceGap { current: Option<u64>, based_on: u64 },

    #[error("Delta references unknown player {0}")]
    UnknownPlayer(Uuid),

    #[error("Delta references unknown projectile {0}")]
    UnknownProjectile(u64),
}

/// Reconstructs match state from a payload stream the way a client does
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaState {
    pub sequence: Option<u64>,
    pub players: Vec<PlayerSnapshot>,
    pub projectiles: BTreeMap<u64, ProjectileSnapshot>,
    pub round: Option<RoundSnapshot>,
    pub winner_id: Option<Uuid>,
}

impl ReplicaState {
    /// Apply one payload. A failed delta leaves the replica untouched; the
    /// caller should request a full sync.
    pub fn apply(&mut self, payload: &StatePayload) -> Result<(), DeltaError> {
        match payload {
            StatePayload::Full(full) => {
                *self = Self {
                    sequence: Some(full.sequence),
                    players: full.players.clone(),
                    projectiles: full.projectiles.iter().map(|p| (p.id, p.clone())).collect(),
                    round: Some(full.round),
                    winner_id: full.winner_id,
                };
                Ok(())
            }
            StatePayload::Delta(delta) => {
                if self.sequence != Some(delta.based_on) {
                    return Err(DeltaError::SequenceGap {
                        current: self.sequence,
                        based_on: delta.based_on,
                    });
                }
                let mut next = self.clone();
                next.apply_delta(delta)?;
                *self = next;
                Ok(())
            }
        }
    }

    fn apply_delta(&mut self, delta: &GameStateDelta) -> Result<(), DeltaError> {
        for change in &delta.players {
            match self.players.iter_mut().find(|p| p.id == change.id) {
                Some(player) => change.apply_to(player),
                None => {
                    let player = PlayerSnapshot::from_delta(change).ok_or(DeltaError::UnknownPlayer(change.id))?;
                    self.players.push(player);
                }
            }
        }

        for change in &delta.projectiles {
            match change {
                ProjectileDelta::Create(snapshot) => {
                    self.projectiles.insert(snapshot.id, snapshot.clone());
                }
                ProjectileDelta::Update { id, x, y, vx, vy } => {
                    let projectile = self.projectiles.get_mut(id).ok_or(DeltaError::UnknownProjectile(*id))?;
                    projectile.x = x.unwrap_or(projectile.x);
                    projectile.y = y.unwrap_or(projectile.y);
                    projectile.vx = vx.unwrap_or(projectile.vx);
                    projectile.vy = vy.unwrap_or(projectile.vy);
                }
                ProjectileDelta::Destroy { id } => {
                    self.projectiles.remove(id).ok_or(DeltaError::UnknownProjectile(*id))?;
                }
            }
        }

        if let Some(round) = delta.round {
            self.round = Some(round);
        }
        if delta.winner_id.is_some() {
            self.winner_id = delta.winner_id;
        }
        self.sequence = Some(delta.sequence);
        Ok(())
    }
}
