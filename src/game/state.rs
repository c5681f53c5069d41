//! Canonical match state and its mutation surface

use std::collections::BTreeMap;

use glam::Vec2;
use tracing::warn;
use uuid::Uuid;

use crate::ws::protocol::{ClassType, GameEvent, PlayerInfo};

use super::collision::MapData;
use super::combat::{apply_damage, calculate_damage, ClassStats};
use super::delta::{DeltaStateManager, StatePayload};
use super::projectile::Projectile;
use super::round::{RoundStatus, Score};

/// Player state in a match (authoritative)
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub id: Uuid,
    pub username: String,
    pub class_type: ClassType,
    /// Carried for the rating service, never used by the simulation
    pub rating: i32,

    // Position and movement
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: f32,

    // Combat
    pub health: i32,
    pub max_health: i32,
    pub armor: f32,
    pub is_alive: bool,
    /// Server time (Unix millis) when the weapon may fire again
    pub weapon_ready_at: u64,
    pub last_attacker: Option<Uuid>,

    // Connection / reconciliation
    pub last_processed_input: u32,
    pub connected: bool,

    // Stats
    pub round_damage_dealt: i32,
    pub damage_dealt: i32,
    pub damage_taken: i32,
    pub kills: u32,
    pub shots_fired: u32,
    pub shots_hit: u32,

    spawn_position: Vec2,
    spawn_rotation: f32,
}

impl PlayerState {
    pub fn new(
        id: Uuid,
        username: String,
        class_type: ClassType,
        rating: i32,
        spawn_position: Vec2,
        spawn_rotation: f32,
    ) -> Self {
        let stats = ClassStats::for_class(class_type);
        Self {
            id,
            username,
            class_type,
            rating,
            position: spawn_position,
            velocity: Vec2::ZERO,
            rotation: spawn_rotation,
            health: stats.max_health,
            max_health: stats.max_health,
            armor: stats.armor,
            is_alive: true,
            weapon_ready_at: 0,
            last_attacker: None,
            last_processed_input: 0,
            connected: false,
            round_damage_dealt: 0,
            damage_dealt: 0,
            damage_taken: 0,
            kills: 0,
            shots_fired: 0,
            shots_hit: 0,
            spawn_position,
            spawn_rotation,
        }
    }

    pub fn hit_radius(&self) -> f32 {
        ClassStats::for_class(self.class_type).hit_radius
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.id,
            username: self.username.clone(),
            class_type: self.class_type,
            rating: self.rating,
        }
    }

    fn respawn(&mut self) {
        self.position = self.spawn_position;
        self.velocity = Vec2::ZERO;
        self.rotation = self.spawn_rotation;
        self.health = self.max_health;
        self.is_alive = true;
        self.weapon_ready_at = 0;
        self.last_attacker = None;
        self.round_damage_dealt = 0;
    }
}

/// Round information mirrored from the round system for replication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub round: u32,
    /// Whole seconds left on the round timer
    pub time_left: u32,
    pub status: RoundStatus,
    pub score: Score,
}

/// Result of applying damage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageOutcome {
    pub damage: i32,
    pub remaining_health: i32,
    pub killed: bool,
}

/// Everything the delta engine and physics read each tick
#[derive(Debug, Clone)]
pub struct GameState {
    pub match_id: Uuid,
    /// Player one first, player two second
    pub players: Vec<PlayerState>,
    pub projectiles: BTreeMap<u64, Projectile>,
    pub round: RoundInfo,
    pub winner_id: Option<Uuid>,
    /// Transient events waiting for the next outbound payload
    pub events: Vec<GameEvent>,
}

/// Owns one match's state; its methods are the only way to change it
pub struct GameStateManager {
    state: GameState,
    map: MapData,
    next_projectile_id: u64,
}

impl GameStateManager {
    pub fn new(match_id: Uuid, map: MapData) -> Self {
        Self {
            state: GameState {
                match_id,
                players: Vec::with_capacity(2),
                projectiles: BTreeMap::new(),
                round: RoundInfo {
                    round: 0,
                    time_left: 0,
                    status: RoundStatus::Pending,
                    score: Score::default(),
                },
                winner_id: None,
                events: Vec::new(),
            },
            map,
            next_projectile_id: 1,
        }
    }

    /// Live state for reads within the current tick
    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn map(&self) -> &MapData {
        &self.map
    }

    pub fn players(&self) -> &[PlayerState] {
        &self.state.players
    }

    pub fn player(&self, id: &Uuid) -> Option<&PlayerState> {
        self.state.players.iter().find(|p| &p.id == id)
    }

    fn player_mut(&mut self, id: &Uuid) -> Option<&mut PlayerState> {
        self.state.players.iter_mut().find(|p| &p.id == id)
    }

    pub fn player_ids(&self) -> Vec<Uuid> {
        self.state.players.iter().map(|p| p.id).collect()
    }

    pub fn alive_count(&self) -> usize {
        self.state.players.iter().filter(|p| p.is_alive).count()
    }

    pub fn add_player(&mut self, id: Uuid, username: String, class_type: ClassType, rating: i32) {
        if self.player(&id).is_some() {
            warn!(match_id = %self.state.match_id, player_id = %id, "Player already in match");
            return;
        }
        let (spawn, facing) = self.map.spawn_for(self.state.players.len());
        self.state
            .players
            .push(PlayerState::new(id, username, class_type, rating, spawn, facing));
    }

    pub fn update_player_position(&mut self, id: &Uuid, position: Vec2, velocity: Vec2) {
        if let Some(player) = self.player_mut(id) {
            player.position = position;
            player.velocity = velocity;
        }
    }

    pub fn update_player_rotation(&mut self, id: &Uuid, rotation: f32) {
        if let Some(player) = self.player_mut(id) {
            player.rotation = rotation.rem_euclid(std::f32::consts::TAU);
        }
    }

    pub fn record_processed_input(&mut self, id: &Uuid, sequence: u32) {
        if let Some(player) = self.player_mut(id) {
            player.last_processed_input = player.last_processed_input.max(sequence);
        }
    }

    pub fn set_connected(&mut self, id: &Uuid, connected: bool) {
        if let Some(player) = self.player_mut(id) {
            player.connected = connected;
        }
    }

    /// Start the weapon cooldown and count the shot
    pub fn record_shot(&mut self, id: &Uuid, ready_at: u64) {
        if let Some(player) = self.player_mut(id) {
            player.weapon_ready_at = ready_at;
            player.shots_fired += 1;
        }
    }

    /// Apply armor-adjusted damage to a living player.
    ///
    /// Credits the attacker's damage counters (the per-round one feeds the
    /// timeout tie-break) and emits hit/kill events.
    pub fn damage_player(
        &mut self,
        target_id: &Uuid,
        base_damage: f32,
        armor_penetration: f32,
        attacker_id: Option<Uuid>,
    ) -> Option<DamageOutcome> {
        let target = self.player_mut(target_id)?;
        if !target.is_alive {
            return None;
        }

        let damage = calculate_damage(base_damage, target.armor, armor_penetration);
        let (remaining_health, killed) = apply_damage(target.health, damage);
        target.health = remaining_health;
        target.damage_taken += damage;
        if attacker_id.is_some() {
            target.last_attacker = attacker_id;
        }
        if killed {
            target.is_alive = false;
            target.velocity = Vec2::ZERO;
        }
        let position = target.position;

        if let Some(attacker) = attacker_id.and_then(|id| self.player_mut(&id)) {
            attacker.round_damage_dealt += damage;
            attacker.damage_dealt += damage;
            attacker.shots_hit += 1;
            if killed {
                attacker.kills += 1;
            }
        }

        self.add_event(GameEvent::PlayerHit {
            attacker_id,
            target_id: *target_id,
            damage,
            position,
        });
        if killed {
            self.add_event(GameEvent::PlayerKilled {
                killer_id: attacker_id,
                victim_id: *target_id,
            });
        }

        Some(DamageOutcome {
            damage,
            remaining_health,
            killed,
        })
    }

    pub fn next_projectile_id(&mut self) -> u64 {
        let id = self.next_projectile_id;
        self.next_projectile_id += 1;
        id
    }

    pub fn add_projectile(&mut self, projectile: Projectile) {
        self.state.projectiles.insert(projectile.id, projectile);
    }

    /// Replace a projectile with its advanced copy; removed projectiles stay removed
    pub fn update_projectile(&mut self, projectile: Projectile) {
        if let Some(existing) = self.state.projectiles.get_mut(&projectile.id) {
            *existing = projectile;
        }
    }

    pub fn remove_projectile(&mut self, id: u64) -> Option<Projectile> {
        self.state.projectiles.remove(&id)
    }

    /// Remember that a piercing projectile already hit `player_id`
    pub fn mark_projectile_hit(&mut self, id: u64, player_id: Uuid) {
        if let Some(projectile) = self.state.projectiles.get_mut(&id) {
            projectile.hit_players.push(player_id);
        }
    }

    pub fn add_event(&mut self, event: GameEvent) {
        self.state.events.push(event);
    }

    /// Reset players and projectiles for a new round
    pub fn start_round(&mut self, round: u32, duration_secs: u32) {
        for player in &mut self.state.players {
            player.respawn();
        }
        self.state.projectiles.clear();
        self.state.round.round = round;
        self.state.round.time_left = duration_secs;
        self.state.round.status = RoundStatus::Active;
    }

    pub fn end_round(&mut self, score: Score) {
        self.state.round.score = score;
        self.state.round.status = RoundStatus::Intermission;
    }

    pub fn end_match(&mut self, winner_id: Uuid, score: Score) {
        self.state.round.score = score;
        self.state.round.status = RoundStatus::Complete;
        self.state.winner_id = Some(winner_id);
    }

    pub fn update_round_time(&mut self, seconds_left: u32) {
        self.state.round.time_left = seconds_left;
    }

    /// Build this tick's outbound payload, consuming pending events
    pub fn generate_delta(&mut self, deltas: &DeltaStateManager, now: u64) -> StatePayload {
        let events = std::mem::take(&mut self.state.events);
        deltas.generate_delta(&self.state, events, now)
    }
}
