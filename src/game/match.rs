//! Match orchestration and the authoritative tick loop

use std::collections::HashMap;
use std::f32::consts::{PI, TAU};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::store::{MatchOutcome, MatchResultSink};
use crate::util::time::{secs_to_ticks, tick_delta, tick_duration_micros, unix_millis, Timer};
use crate::ws::protocol::{ClientMsg, GameEvent, PlayerInfo, ServerMsg};

use super::collision::{CollisionSystem, HitCandidate, MapData};
use super::combat::{ProjectileKind, WeaponProfile};
use super::delta::DeltaStateManager;
use super::input::{InputAction, InputCommand, InputQueue};
use super::movement::{calculate_movement, validate_movement, MovementIntent};
use super::projectile::{HitType, HomingTarget, ProjectilePhysics, RayTarget};
use super::round::{RoundEvent, RoundStatus, RoundSystem};
use super::state::GameStateManager;

/// Capacity of the transport -> match command channel
const COMMAND_CHANNEL_CAPACITY: usize = 512;

/// Messages from the transport layer to a match loop
#[derive(Debug)]
pub enum MatchCommand {
    /// A socket for `player_id` opened; outbound messages go to `sender`
    Connect {
        player_id: Uuid,
        connection_id: Uuid,
        sender: mpsc::Sender<ServerMsg>,
    },
    /// A client message, stamped with the server receive time
    Input {
        player_id: Uuid,
        msg: ClientMsg,
        received_at: u64,
    },
    /// The socket identified by `connection_id` closed
    Disconnect { player_id: Uuid, connection_id: Uuid },
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub command_tx: mpsc::Sender<MatchCommand>,
    pub player_ids: [Uuid; 2],
    connected_count: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
}

impl MatchHandle {
    pub fn connected_players(&self) -> usize {
        self.connected_count.load(Ordering::Relaxed)
    }

    pub fn has_player(&self, player_id: &Uuid) -> bool {
        self.player_ids.contains(player_id)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Cancel the match; the loop exits before doing any more work
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.matches.contains_key(id)
    }

    /// Register a match; returns false if the id is already taken
    pub fn insert(&self, handle: MatchHandle) -> bool {
        match self.matches.entry(handle.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().connected_players())
            .sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientConnection {
    connection_id: Uuid,
    sender: mpsc::Sender<ServerMsg>,
}

/// The authoritative game match.
///
/// Owns the only mutable copy of the match state. Transport talks to it
/// exclusively through [`MatchCommand`]s, which are drained at the start of
/// each tick.
pub struct GameMatch {
    id: Uuid,
    config: MatchConfig,
    state: GameStateManager,
    rounds: RoundSystem,
    collision: CollisionSystem,
    deltas: Arc<DeltaStateManager>,
    reporter: Arc<dyn MatchResultSink>,
    command_rx: mpsc::Receiver<MatchCommand>,
    clients: HashMap<Uuid, ClientConnection>,
    queues: HashMap<Uuid, InputQueue>,
    /// Tick at which a disconnected (or never connected) player forfeits
    grace_deadlines: HashMap<Uuid, u64>,
    /// Players whose grace ran out while the opponent was also away
    expired: Vec<Uuid>,
    /// Nobody left to play; ends without a result
    abandoned: bool,
    tick: u64,
    connected_count: Arc<AtomicUsize>,
    active: Arc<AtomicBool>,
}

impl GameMatch {
    /// Create a match for a completed handoff. Round 1 starts once both
    /// players are connected; a player who never shows up forfeits when the
    /// disconnect grace runs out. If neither shows up the match is abandoned.
    pub fn new(
        id: Uuid,
        players: [PlayerInfo; 2],
        map: MapData,
        config: MatchConfig,
        deltas: Arc<DeltaStateManager>,
        reporter: Arc<dyn MatchResultSink>,
        seed: u64,
    ) -> (Self, MatchHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let connected_count = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let player_ids = [players[0].player_id, players[1].player_id];

        let collision = CollisionSystem::from_map(&map);
        let mut state = GameStateManager::new(id, map);
        let mut queues = HashMap::new();
        let mut grace_deadlines = HashMap::new();
        let connect_window = secs_to_ticks(config.disconnect_grace_secs, config.tick_rate);
        for player in players {
            queues.insert(player.player_id, InputQueue::new(player.player_id, &config));
            grace_deadlines.insert(player.player_id, connect_window);
            state.add_player(player.player_id, player.username, player.class_type, player.rating);
        }

        let rounds = RoundSystem::new(id, player_ids[0], player_ids[1], &config, seed);

        let handle = MatchHandle {
            id,
            command_tx,
            player_ids,
            connected_count: connected_count.clone(),
            active: active.clone(),
        };

        let game_match = Self {
            id,
            config,
            state,
            rounds,
            collision,
            deltas,
            reporter,
            command_rx,
            clients: HashMap::new(),
            queues,
            grace_deadlines,
            expired: Vec::new(),
            abandoned: false,
            tick: 0,
            connected_count,
            active,
        };

        (game_match, handle)
    }

    /// Run the authoritative tick loop until the match completes or is stopped
    pub async fn run(mut self) {
        info!(match_id = %self.id, "Match loop started");

        let tick_budget_micros = tick_duration_micros(self.config.tick_rate);
        let mut tick_interval = interval(Duration::from_micros(tick_budget_micros));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;

            if !self.active.load(Ordering::Relaxed) {
                info!(match_id = %self.id, "Match cancelled");
                break;
            }

            let timer = Timer::new();
            let now = unix_millis();
            if catch_unwind(AssertUnwindSafe(|| self.tick(now))).is_err() {
                error!(match_id = %self.id, tick = self.tick, "Tick panicked, continuing with next tick");
            }

            let elapsed = timer.elapsed_micros();
            if elapsed > tick_budget_micros {
                warn!(match_id = %self.id, tick = self.tick, elapsed_micros = elapsed, "Slow tick");
            }

            if self.is_finished() {
                break;
            }
        }

        self.active.store(false, Ordering::Relaxed);
        self.log_input_stats();
        info!(match_id = %self.id, ticks = self.tick, "Match loop ended");
    }

    pub fn is_finished(&self) -> bool {
        self.abandoned || self.rounds.is_complete()
    }

    /// One simulation step. Synchronous; nothing here awaits.
    pub fn tick(&mut self, now: u64) {
        self.tick += 1;

        self.process_commands(now);
        if self.rounds.status() == RoundStatus::Pending && self.clients.len() == self.queues.len() {
            self.rounds.start_match(&mut self.state);
        }

        self.process_inputs(now);
        self.update_projectiles();
        self.check_win_condition();
        self.rounds.tick(&mut self.state);
        self.check_grace_deadlines();

        self.dispatch_round_events();
        self.broadcast_state(now);
    }

    // ------------------------------------------------------------------
    // Transport commands
    // ------------------------------------------------------------------

    fn process_commands(&mut self, now: u64) {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                MatchCommand::Connect {
                    player_id,
                    connection_id,
                    sender,
                } => self.handle_connect(player_id, connection_id, sender, now),
                MatchCommand::Input {
                    player_id,
                    msg,
                    received_at,
                } => self.handle_message(player_id, msg, received_at, now),
                MatchCommand::Disconnect {
                    player_id,
                    connection_id,
                } => self.handle_disconnect(player_id, connection_id),
            }
        }
    }

    fn handle_connect(&mut self, player_id: Uuid, connection_id: Uuid, sender: mpsc::Sender<ServerMsg>, now: u64) {
        if !self.queues.contains_key(&player_id) {
            warn!(match_id = %self.id, player_id = %player_id, "Connect from player not in this match");
            let _ = sender.try_send(ServerMsg::Error {
                code: "not_in_match".to_string(),
                message: "Player is not part of this match".to_string(),
            });
            return;
        }

        let welcome = ServerMsg::Welcome {
            player_id,
            match_id: self.id,
            server_time: now,
            players: self.state.players().iter().map(|p| p.info()).collect(),
            map: self.state.map().clone(),
        };
        if sender.try_send(welcome).is_err() {
            warn!(match_id = %self.id, player_id = %player_id, "Could not deliver welcome");
        }

        let replaced = self
            .clients
            .insert(player_id, ClientConnection { connection_id, sender })
            .is_some();
        self.grace_deadlines.remove(&player_id);
        self.state.set_connected(&player_id, true);
        self.connected_count.store(self.clients.len(), Ordering::Relaxed);
        // The newcomer has no baseline to apply deltas to
        self.deltas.request_full_sync(self.id);

        info!(match_id = %self.id, player_id = %player_id, replaced, "Player connected");
        self.broadcast_except(&player_id, ServerMsg::PlayerConnection {
            player_id,
            connected: true,
        });
    }

    fn handle_disconnect(&mut self, player_id: Uuid, connection_id: Uuid) {
        let current = self
            .clients
            .get(&player_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if !current {
            // A newer socket already replaced this one
            return;
        }

        self.clients.remove(&player_id);
        self.state.set_connected(&player_id, false);
        self.connected_count.store(self.clients.len(), Ordering::Relaxed);
        if !self.rounds.is_complete() {
            let deadline = self.tick + secs_to_ticks(self.config.disconnect_grace_secs, self.config.tick_rate);
            self.grace_deadlines.insert(player_id, deadline);
        }

        info!(
            match_id = %self.id,
            player_id = %player_id,
            grace_secs = self.config.disconnect_grace_secs,
            "Player disconnected"
        );
        self.broadcast_except(&player_id, ServerMsg::PlayerConnection {
            player_id,
            connected: false,
        });
    }

    fn handle_message(&mut self, player_id: Uuid, msg: ClientMsg, received_at: u64, now: u64) {
        match msg {
            ClientMsg::Ping { t } => {
                self.send_to(&player_id, ServerMsg::Pong { t, server_time: now });
            }
            ClientMsg::RequestResync { last_sequence } => {
                debug!(match_id = %self.id, player_id = %player_id, last_sequence = ?last_sequence, "Resync requested");
                self.deltas.request_full_sync(self.id);
            }
            other => {
                let Some(queue) = self.queues.get_mut(&player_id) else {
                    return;
                };
                if let Some(command) = InputCommand::from_client_msg(&other, received_at) {
                    queue.push(command);
                }
            }
        }
    }

    /// Forfeit a player whose grace ran out, but only to an opponent who is
    /// still here. With both players gone the match is abandoned unreported.
    fn check_grace_deadlines(&mut self) {
        if self.is_finished() {
            return;
        }

        let mut newly_expired: Vec<Uuid> = self
            .grace_deadlines
            .iter()
            .filter(|(_, deadline)| self.tick >= **deadline)
            .map(|(id, _)| *id)
            .collect();
        newly_expired.sort();
        for player_id in newly_expired {
            self.grace_deadlines.remove(&player_id);
            info!(match_id = %self.id, player_id = %player_id, "Reconnect grace expired");
            self.expired.push(player_id);
        }
        // A player who came back is no longer forfeiting
        let clients = &self.clients;
        self.expired.retain(|id| !clients.contains_key(id));
        if self.expired.is_empty() {
            return;
        }

        if self.expired.len() == self.queues.len() {
            self.abandon();
            return;
        }

        let opponent_present = self
            .queues
            .keys()
            .filter(|id| !self.expired.contains(id))
            .all(|id| self.clients.contains_key(id));
        if opponent_present {
            let loser = self.expired[0];
            self.expired.clear();
            self.rounds.on_player_disconnected(&mut self.state, loser);
        }
    }

    fn abandon(&mut self) {
        info!(match_id = %self.id, round = self.rounds.current_round(), "Both players gone, abandoning match");
        self.abandoned = true;
        self.expired.clear();
        self.grace_deadlines.clear();
        self.active.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Simulation
    // ------------------------------------------------------------------

    fn delta_time(&self) -> f32 {
        tick_delta(self.config.tick_rate)
    }

    /// Apply each player's queued inputs in sequence order
    fn process_inputs(&mut self, now: u64) {
        for player_id in self.state.player_ids() {
            let Some(queue) = self.queues.get_mut(&player_id) else {
                continue;
            };
            let (commands, highest) = queue.drain_ordered(self.config.movement_inputs_per_tick);

            // Net facing change applied to this player so far this tick
            let mut turned = 0.0;
            for command in &commands {
                self.apply_input(player_id, command, &mut turned, now);
            }
            if let Some(sequence) = highest {
                self.state.record_processed_input(&player_id, sequence);
            }
        }
    }

    fn apply_input(&mut self, player_id: Uuid, command: &InputCommand, turned: &mut f32, now: u64) {
        let Some(player) = self.state.player(&player_id) else {
            return;
        };
        if !player.is_alive {
            return;
        }
        let position = player.position;
        let rotation = player.rotation;

        let status = self.rounds.status();
        let can_move = matches!(status, RoundStatus::Active | RoundStatus::Intermission);

        match command.action {
            InputAction::Move {
                forward,
                strafe,
                sprint,
            } if can_move => {
                let intent = MovementIntent {
                    forward,
                    strafe,
                    sprint,
                    facing_angle: rotation,
                };
                let step = calculate_movement(position, &intent, self.delta_time());
                let bounded = validate_movement(position, step.position, Some(self.collision.bounds()));
                let resolved = self.collision.validate_player_movement(position, bounded, step.velocity);
                let new_position = resolved.corrected_position.unwrap_or(bounded);
                let new_velocity = resolved.corrected_velocity.unwrap_or(step.velocity);
                self.state.update_player_position(&player_id, new_position, new_velocity);
            }
            InputAction::Look { angle_delta } if can_move => {
                let max_turn = self.config.max_turn_per_tick;
                let total = (*turned + angle_delta).clamp(-max_turn, max_turn);
                let step = total - *turned;
                *turned = total;
                if step != 0.0 {
                    self.state.update_player_rotation(&player_id, rotation + step);
                }
            }
            InputAction::Attack { direction, .. } if status == RoundStatus::Active => {
                self.fire_weapon(player_id, direction, now);
            }
            InputAction::Ability { slot } => {
                debug!(match_id = %self.id, player_id = %player_id, slot, "Ability input acknowledged");
            }
            _ => {}
        }
    }

    fn fire_weapon(&mut self, shooter_id: Uuid, direction: f32, now: u64) {
        let Some(shooter) = self.state.player(&shooter_id) else {
            return;
        };
        if now < shooter.weapon_ready_at {
            debug!(match_id = %self.id, player_id = %shooter_id, "Attack during cooldown dropped");
            return;
        }
        let origin = shooter.position;
        let class_type = shooter.class_type;
        let aim = clamp_aim(shooter.rotation, direction, self.config.max_aim_deviation);
        let weapon = WeaponProfile::for_class(class_type);

        self.state.record_shot(&shooter_id, now + weapon.cooldown_ms);

        match weapon.kind() {
            ProjectileKind::Hitscan => {
                let targets: Vec<RayTarget> = self
                    .state
                    .players()
                    .iter()
                    .map(|p| RayTarget {
                        id: p.id,
                        position: p.position,
                        radius: p.hit_radius(),
                        alive: p.is_alive,
                    })
                    .collect();
                let result =
                    ProjectilePhysics::process_hitscan_weapon(origin, aim, weapon.range, shooter_id, &targets, &self.collision);

                self.state.add_event(GameEvent::HitscanFired {
                    shooter_id,
                    start: origin,
                    end: result.hit_position,
                    hit_player_id: result.hit_player_id,
                });
                if let (HitType::Player, Some(target_id)) = (result.hit_type, result.hit_player_id) {
                    self.state
                        .damage_player(&target_id, weapon.damage, weapon.armor_penetration, Some(shooter_id));
                }
            }
            ProjectileKind::Arrow => {
                let target_id = self
                    .state
                    .players()
                    .iter()
                    .find(|p| p.id != shooter_id && p.is_alive)
                    .map(|p| p.id);
                let id = self.state.next_projectile_id();
                let projectile =
                    ProjectilePhysics::create_projectile(id, shooter_id, origin, aim, class_type, target_id, now);
                self.state.add_projectile(projectile);
            }
        }
    }

    /// Advance projectiles, drop expired ones, then resolve hits
    fn update_projectiles(&mut self) {
        if self.state.state().projectiles.is_empty() {
            return;
        }

        let targets: Vec<HomingTarget> = self
            .state
            .players()
            .iter()
            .map(|p| HomingTarget {
                id: p.id,
                position: p.position,
                alive: p.is_alive,
            })
            .collect();
        let step = ProjectilePhysics::update_projectiles(&self.state.state().projectiles, &targets, self.delta_time());

        for id in step.expired {
            self.state.remove_projectile(id);
        }
        for projectile in step.updated {
            self.state.update_projectile(projectile);
        }

        let ids: Vec<u64> = self.state.state().projectiles.keys().copied().collect();
        for id in ids {
            self.resolve_projectile(id);
        }
    }

    fn resolve_projectile(&mut self, id: u64) {
        let Some(projectile) = self.state.state().projectiles.get(&id).cloned() else {
            return;
        };
        if self.state.player(&projectile.owner_id).is_none() {
            warn!(match_id = %self.id, projectile_id = id, "Projectile owner missing, removing projectile");
            self.state.remove_projectile(id);
            return;
        }

        let wall = self
            .collision
            .check_projectile_wall_collision(projectile.previous_position, projectile.position);
        // Players behind the wall are out of reach this step
        let path_end = wall.point.unwrap_or(projectile.position);

        let candidates: Vec<HitCandidate> = self
            .state
            .players()
            .iter()
            .filter(|p| p.is_alive && p.id != projectile.owner_id && !projectile.hit_players.contains(&p.id))
            .map(|p| HitCandidate {
                id: p.id,
                position: p.position,
                radius: p.hit_radius(),
            })
            .collect();
        let hit = self.collision.check_projectile_player_collision(
            projectile.previous_position,
            path_end,
            projectile.radius,
            &candidates,
        );

        if let Some(target_id) = hit.player_id {
            let outcome = self.state.damage_player(
                &target_id,
                projectile.damage,
                projectile.armor_penetration,
                Some(projectile.owner_id),
            );
            let target_survived = outcome.is_some_and(|o| !o.killed);
            if projectile.piercing && target_survived {
                self.state.mark_projectile_hit(id, target_id);
            } else {
                self.state.remove_projectile(id);
                return;
            }
        }

        if let (true, Some(point), Some(wall_id)) = (wall.hit, wall.point, wall.wall_id) {
            self.state.remove_projectile(id);
            self.state.add_event(GameEvent::ProjectileImpact {
                projectile_id: id,
                position: point,
                wall_id,
            });
        }
    }

    fn check_win_condition(&mut self) {
        if self.rounds.status() != RoundStatus::Active {
            return;
        }
        let alive = self.state.alive_count();
        if alive > 1 {
            return;
        }

        let players = self.state.players();
        if alive == 0 {
            // Simultaneous deaths are not a game rule; credit player one and flag it
            let (Some(first), Some(second)) = (players.first(), players.get(1)) else {
                warn!(match_id = %self.id, "Win check with missing players");
                return;
            };
            let (winner, loser) = (first.id, second.id);
            warn!(match_id = %self.id, winner_id = %winner, "No players alive at win check, crediting player one");
            self.rounds.on_player_eliminated(&mut self.state, loser, Some(winner));
            return;
        }

        let Some(dead) = players.iter().find(|p| !p.is_alive) else {
            return;
        };
        let (dead_id, killer_id) = (dead.id, dead.last_attacker);
        self.rounds.on_player_eliminated(&mut self.state, dead_id, killer_id);
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn dispatch_round_events(&mut self) {
        for event in self.rounds.drain_events() {
            let msg = match event {
                RoundEvent::RoundStarted { round, duration_secs } => ServerMsg::RoundStarted {
                    match_id: self.id,
                    round,
                    duration_secs,
                },
                RoundEvent::TimeWarning {
                    round,
                    seconds_remaining,
                } => ServerMsg::TimeWarning {
                    match_id: self.id,
                    round,
                    seconds_remaining,
                },
                RoundEvent::RoundEnded(result) => ServerMsg::RoundEnded {
                    match_id: self.id,
                    result,
                },
                RoundEvent::CountdownTick {
                    next_round,
                    seconds_remaining,
                } => ServerMsg::CountdownTick {
                    match_id: self.id,
                    next_round,
                    seconds_remaining,
                },
                RoundEvent::CountdownComplete { next_round } => ServerMsg::CountdownComplete {
                    match_id: self.id,
                    next_round,
                },
                RoundEvent::MatchCompleted(result) => {
                    self.reporter.submit(MatchOutcome::new(&result, self.state.players()));
                    self.grace_deadlines.clear();
                    ServerMsg::MatchEnded {
                        match_id: self.id,
                        result,
                    }
                }
            };
            self.broadcast(msg);
        }
    }

    /// One payload per tick, tagged per client with its own input ack
    fn broadcast_state(&mut self, now: u64) {
        let payload = self.state.generate_delta(&self.deltas, now);
        for player in self.state.players() {
            let Some(client) = self.clients.get(&player.id) else {
                continue;
            };
            let msg = ServerMsg::State {
                payload: payload.clone(),
                last_processed_input: player.last_processed_input,
            };
            try_deliver(self.id, &player.id, &client.sender, msg);
        }
    }

    fn send_to(&self, player_id: &Uuid, msg: ServerMsg) {
        if let Some(client) = self.clients.get(player_id) {
            try_deliver(self.id, player_id, &client.sender, msg);
        }
    }

    fn broadcast(&self, msg: ServerMsg) {
        for (player_id, client) in &self.clients {
            try_deliver(self.id, player_id, &client.sender, msg.clone());
        }
    }

    fn broadcast_except(&self, excluded: &Uuid, msg: ServerMsg) {
        for (player_id, client) in self.clients.iter().filter(|(id, _)| *id != excluded) {
            try_deliver(self.id, player_id, &client.sender, msg.clone());
        }
    }

    fn log_input_stats(&self) {
        for (player_id, queue) in &self.queues {
            let stats = queue.stats();
            info!(
                match_id = %self.id,
                player_id = %player_id,
                accepted = stats.accepted,
                stale = stats.stale,
                rate_limited = stats.rate_limited,
                malformed = stats.malformed,
                duplicate = stats.duplicate,
                over_budget = stats.over_budget,
                "Input stats"
            );
        }
    }
}

/// Never block the tick on a slow client
fn try_deliver(match_id: Uuid, player_id: &Uuid, sender: &mpsc::Sender<ServerMsg>, msg: ServerMsg) {
    match sender.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(match_id = %match_id, player_id = %player_id, "Client lagging, dropped outbound message");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(match_id = %match_id, player_id = %player_id, "Client channel closed");
        }
    }
}

/// Limit how far an attack may point away from the authoritative facing
fn clamp_aim(facing: f32, requested: f32, max_deviation: f32) -> f32 {
    let deviation = (requested - facing + PI).rem_euclid(TAU) - PI;
    (facing + deviation.clamp(-max_deviation, max_deviation)).rem_euclid(TAU)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::collision::{ArenaBounds, Wall};
    use crate::game::delta::StatePayload;
    use crate::game::round::MatchEndReason;
    use crate::ws::protocol::{AttackAction, AttackData, ClassType, LookData, MovementData};
    use glam::Vec2;
    use parking_lot::Mutex;

    const NOW: u64 = 1_000_000;

    #[derive(Default)]
    struct RecordingSink {
        outcomes: Mutex<Vec<MatchOutcome>>,
    }

    impl MatchResultSink for RecordingSink {
        fn submit(&self, outcome: MatchOutcome) {
            self.outcomes.lock().push(outcome);
        }
    }

    struct Harness {
        game: GameMatch,
        handle: MatchHandle,
        sink: Arc<RecordingSink>,
        a: Uuid,
        b: Uuid,
        a_rx: mpsc::Receiver<ServerMsg>,
        b_rx: mpsc::Receiver<ServerMsg>,
        a_conn: Uuid,
        b_conn: Uuid,
    }

    fn player(class_type: ClassType, name: &str) -> PlayerInfo {
        PlayerInfo {
            player_id: Uuid::new_v4(),
            username: name.to_string(),
            class_type,
            rating: 1000,
        }
    }

    fn harness_with(class_a: ClassType, class_b: ClassType, walls: Vec<Wall>) -> Harness {
        let pa = player(class_a, "alice");
        let pb = player(class_b, "bob");
        let (a, b) = (pa.player_id, pb.player_id);
        let map = MapData {
            walls,
            bounds: ArenaBounds::new(-10.0, -10.0, 10.0, 10.0),
            spawn_points: Some([Vec2::new(0.0, 0.0), Vec2::new(5.0, 0.0)]),
        };
        let sink = Arc::new(RecordingSink::default());
        let (game, handle) = GameMatch::new(
            Uuid::new_v4(),
            [pa, pb],
            map,
            MatchConfig::default(),
            Arc::new(DeltaStateManager::new(5_000)),
            sink.clone(),
            42,
        );
        let (_, a_rx) = mpsc::channel(1);
        let (_, b_rx) = mpsc::channel(1);
        Harness {
            game,
            handle,
            sink,
            a,
            b,
            a_rx,
            b_rx,
            a_conn: Uuid::new_v4(),
            b_conn: Uuid::new_v4(),
        }
    }

    fn harness() -> Harness {
        harness_with(ClassType::Gunslinger, ClassType::Gunslinger, vec![])
    }

    fn connect(h: &mut Harness, player_id: Uuid) {
        let (tx, rx) = mpsc::channel(8_192);
        let connection_id = if player_id == h.a { h.a_conn } else { h.b_conn };
        if player_id == h.a {
            h.a_rx = rx;
        } else {
            h.b_rx = rx;
        }
        h.handle
            .command_tx
            .try_send(MatchCommand::Connect {
                player_id,
                connection_id,
                sender: tx,
            })
            .unwrap();
    }

    fn started() -> Harness {
        let mut h = harness();
        let id = h.a;
        connect(&mut h, id);
        let id = h.b;
        connect(&mut h, id);
        h.game.tick(NOW);
        h
    }

    fn send(h: &Harness, player_id: Uuid, msg: ClientMsg, received_at: u64) {
        h.handle
            .command_tx
            .try_send(MatchCommand::Input {
                player_id,
                msg,
                received_at,
            })
            .unwrap();
    }

    fn attack(sequence_id: u32, timestamp: u64, direction: f32) -> ClientMsg {
        ClientMsg::Attack {
            sequence_id,
            timestamp,
            data: AttackData {
                action: AttackAction::PrimaryAttack,
                direction,
                target_position: None,
            },
        }
    }

    fn forward(sequence_id: u32, timestamp: u64) -> ClientMsg {
        ClientMsg::Movement {
            sequence_id,
            timestamp,
            data: MovementData {
                forward: 1.0,
                strafe: 0.0,
                sprint: false,
            },
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_match_starts_when_both_players_connect() {
        let mut h = harness();
        let id = h.a;
        connect(&mut h, id);
        h.game.tick(NOW);
        let first = drain(&mut h.a_rx);
        assert!(matches!(first[0], ServerMsg::Welcome { .. }));
        assert!(matches!(&first[1], ServerMsg::State { payload: StatePayload::Full(_), .. }));
        assert_eq!(h.game.rounds.status(), RoundStatus::Pending);

        let id = h.b;

        connect(&mut h, id);
        h.game.tick(NOW + 33);
        assert_eq!(h.game.rounds.status(), RoundStatus::Active);
        let to_a = drain(&mut h.a_rx);
        assert!(to_a
            .iter()
            .any(|m| matches!(m, ServerMsg::PlayerConnection { connected: true, .. })));
        assert!(to_a.iter().any(|m| matches!(m, ServerMsg::RoundStarted { round: 1, .. })));
        assert_eq!(h.handle.connected_players(), 2);
    }

    #[test]
    fn test_hitscan_attack_damages_and_acknowledges() {
        let mut h = started();
        send(&h, h.a, attack(5, NOW, 0.0), NOW);
        h.game.tick(NOW);

        let target = h.game.state.player(&h.b).unwrap();
        assert_eq!(target.health, 60);
        assert!(target.is_alive);
        assert_eq!(h.game.state.player(&h.a).unwrap().last_processed_input, 5);

        let acked = drain(&mut h.a_rx).into_iter().rev().find_map(|m| match m {
            ServerMsg::State {
                last_processed_input, ..
            } => Some(last_processed_input),
            _ => None,
        });
        assert_eq!(acked, Some(5));

        // Second shot inside the cooldown does nothing
        send(&h, h.a, attack(6, NOW + 100, 0.0), NOW + 100);
        h.game.tick(NOW + 100);
        assert_eq!(h.game.state.player(&h.b).unwrap().health, 60);
        assert_eq!(h.game.state.player(&h.a).unwrap().last_processed_input, 6);
    }

    #[test]
    fn test_stale_input_is_ignored() {
        let mut h = started();
        let before = h.game.state.player(&h.a).unwrap().position;
        send(&h, h.a, forward(1, NOW - 5_000), NOW);
        h.game.tick(NOW);

        let after = h.game.state.player(&h.a).unwrap();
        assert_eq!(after.position, before);
        assert_eq!(after.last_processed_input, 0);
    }

    #[test]
    fn test_movement_is_blocked_by_wall() {
        let wall = Wall {
            id: 1,
            start: Vec2::new(0.1, -5.0),
            end: Vec2::new(0.1, 5.0),
            solid: true,
        };
        let mut h = harness_with(ClassType::Archer, ClassType::Archer, vec![wall]);
        let id = h.a;
        connect(&mut h, id);
        let id = h.b;
        connect(&mut h, id);
        h.game.tick(NOW);

        for seq in 1..=10u32 {
            let at = NOW + seq as u64 * 40;
            send(&h, h.a, forward(seq, at), at);
            h.game.tick(at);
        }
        let a = h.game.state.player(&h.a).unwrap();
        assert!(a.position.x < 0.1);
        assert_eq!(a.last_processed_input, 10);
    }

    #[test]
    fn test_three_hitscan_kills_end_round() {
        let mut h = started();
        for (i, seq) in (1..=3u32).enumerate() {
            let at = NOW + i as u64 * 1_000;
            send(&h, h.a, attack(seq, at, 0.0), at);
            h.game.tick(at);
        }

        assert_eq!(h.game.rounds.status(), RoundStatus::Intermission);
        assert_eq!(h.game.rounds.score().player1_wins, 1);
        let ended = drain(&mut h.b_rx).into_iter().find_map(|m| match m {
            ServerMsg::RoundEnded { result, .. } => Some(result),
            _ => None,
        });
        assert_eq!(ended.map(|r| r.winner_id), Some(h.a));
    }

    #[test]
    fn test_arrow_travels_and_hits() {
        let mut h = harness_with(ClassType::Archer, ClassType::Gunslinger, vec![]);
        let id = h.a;
        connect(&mut h, id);
        let id = h.b;
        connect(&mut h, id);
        h.game.tick(NOW);

        send(&h, h.a, attack(1, NOW, 0.0), NOW);
        h.game.tick(NOW);
        assert_eq!(h.game.state.state().projectiles.len(), 1);

        // 4 units at 20 u/s is well under 10 ticks
        for tick in 1..=10u64 {
            h.game.tick(NOW + tick * 33);
        }
        assert!(h.game.state.state().projectiles.is_empty());
        assert_eq!(h.game.state.player(&h.b).unwrap().health, 65);
    }

    #[test]
    fn test_both_dead_credits_player_one() {
        let mut h = started();
        h.game.state.damage_player(&h.a, 500.0, 0.0, Some(h.b));
        h.game.state.damage_player(&h.b, 500.0, 0.0, Some(h.a));
        h.game.tick(NOW);
        assert_eq!(h.game.rounds.score().player1_wins, 1);
    }

    #[test]
    fn test_disconnect_grace_then_forfeit() {
        let mut h = started();
        h.handle
            .command_tx
            .try_send(MatchCommand::Disconnect {
                player_id: h.b,
                connection_id: h.b_conn,
            })
            .unwrap();

        let grace_ticks = 10 * 30;
        for tick in 0..=grace_ticks {
            h.game.tick(NOW + tick * 33);
        }
        assert!(h.game.is_finished());

        let outcomes = h.sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].winner_id, h.a);
        assert_eq!(outcomes[0].reason, MatchEndReason::Forfeit);
        drop(outcomes);

        let to_a = drain(&mut h.a_rx);
        assert!(to_a
            .iter()
            .any(|m| matches!(m, ServerMsg::PlayerConnection { connected: false, .. })));
        assert!(to_a.iter().any(|m| matches!(m, ServerMsg::MatchEnded { .. })));
    }

    #[test]
    fn test_reconnect_within_grace_keeps_match() {
        let mut h = started();
        h.handle
            .command_tx
            .try_send(MatchCommand::Disconnect {
                player_id: h.b,
                connection_id: h.b_conn,
            })
            .unwrap();
        h.game.tick(NOW);
        assert!(!h.game.state.player(&h.b).unwrap().connected);

        h.b_conn = Uuid::new_v4();
        let id = h.b;
        connect(&mut h, id);
        for tick in 1..=400u64 {
            h.game.tick(NOW + tick * 33);
        }
        assert!(!h.game.is_finished());
        assert!(h.game.state.player(&h.b).unwrap().connected);
        assert!(h.sink.outcomes.lock().is_empty());
    }

    #[test]
    fn test_stale_disconnect_from_replaced_socket_is_ignored() {
        let mut h = started();
        let old_conn = h.b_conn;
        h.b_conn = Uuid::new_v4();
        let id = h.b;
        connect(&mut h, id);
        h.handle
            .command_tx
            .try_send(MatchCommand::Disconnect {
                player_id: h.b,
                connection_id: old_conn,
            })
            .unwrap();
        h.game.tick(NOW);
        assert!(h.game.state.player(&h.b).unwrap().connected);
    }

    #[test]
    fn test_ping_and_resync() {
        let mut h = started();
        drain(&mut h.a_rx);
        h.game.tick(NOW + 33);
        let delta = drain(&mut h.a_rx);
        assert!(matches!(&delta[..], [ServerMsg::State { payload: StatePayload::Delta(_), .. }]));

        send(&h, h.a, ClientMsg::Ping { t: 77 }, NOW);
        send(&h, h.a, ClientMsg::RequestResync { last_sequence: Some(1) }, NOW);
        h.game.tick(NOW + 66);
        let msgs = drain(&mut h.a_rx);
        assert!(msgs.iter().any(|m| matches!(m, ServerMsg::Pong { t: 77, .. })));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::State { payload: StatePayload::Full(_), .. })));
    }

    #[test]
    fn test_unknown_player_is_rejected() {
        let mut h = started();
        let (tx, mut rx) = mpsc::channel(4);
        h.handle
            .command_tx
            .try_send(MatchCommand::Connect {
                player_id: Uuid::new_v4(),
                connection_id: Uuid::new_v4(),
                sender: tx,
            })
            .unwrap();
        h.game.tick(NOW);
        assert!(matches!(rx.try_recv(), Ok(ServerMsg::Error { .. })));
        assert_eq!(h.handle.connected_players(), 2);
    }

    fn look(sequence_id: u32, timestamp: u64, angle_delta: f32) -> ClientMsg {
        ClientMsg::Look {
            sequence_id,
            timestamp,
            data: LookData { angle_delta },
        }
    }

    fn disconnect(h: &Harness, player_id: Uuid) {
        let connection_id = if player_id == h.a { h.a_conn } else { h.b_conn };
        h.handle
            .command_tx
            .try_send(MatchCommand::Disconnect {
                player_id,
                connection_id,
            })
            .unwrap();
    }

    #[test]
    fn test_turn_is_limited_per_tick() {
        let mut h = started();
        let max_turn = h.game.config.max_turn_per_tick;
        let before = h.game.state.player(&h.a).unwrap().rotation;
        for (i, seq) in (1..=3u32).enumerate() {
            let at = NOW + i as u64 * 11;
            send(&h, h.a, look(seq, at, 3.0), at);
        }
        h.game.tick(NOW + 33);

        let after = h.game.state.player(&h.a).unwrap();
        let turned = (after.rotation - before).rem_euclid(TAU);
        assert!((turned - max_turn).abs() < 1e-4, "turned {turned}");
        assert_eq!(after.last_processed_input, 3);

        // Next tick the budget is fresh, and turning back within it is allowed
        send(&h, h.a, look(4, NOW + 40, 3.0), NOW + 40);
        send(&h, h.a, look(5, NOW + 55, -0.5), NOW + 55);
        h.game.tick(NOW + 66);
        let turned = (h.game.state.player(&h.a).unwrap().rotation - before).rem_euclid(TAU);
        assert!((turned - (2.0 * max_turn - 0.5)).abs() < 1e-4, "turned {turned}");
    }

    #[test]
    fn test_match_nobody_joins_is_abandoned() {
        let mut h = harness();
        for tick in 0..=10 * 30u64 {
            h.game.tick(NOW + tick * 33);
        }
        assert!(h.game.is_finished());
        assert!(!h.handle.is_active());
        assert!(!h.game.rounds.is_complete());
        assert!(h.sink.outcomes.lock().is_empty());
    }

    #[test]
    fn test_both_players_dropping_abandons_match() {
        let mut h = started();
        disconnect(&h, h.a);
        disconnect(&h, h.b);
        for tick in 0..=10 * 30u64 {
            h.game.tick(NOW + tick * 33);
        }
        assert!(h.game.is_finished());
        assert!(!h.handle.is_active());
        assert!(h.sink.outcomes.lock().is_empty());
    }

    #[test]
    fn test_expired_player_forfeits_once_opponent_returns() {
        let mut h = started();
        disconnect(&h, h.b);
        for tick in 1..=250u64 {
            h.game.tick(NOW + tick * 33);
        }
        disconnect(&h, h.a);

        // b's grace runs out while a is also away: nothing is decided yet
        for tick in 251..=320u64 {
            h.game.tick(NOW + tick * 33);
        }
        assert!(!h.game.is_finished());
        assert!(h.sink.outcomes.lock().is_empty());

        h.a_conn = Uuid::new_v4();
        let id = h.a;
        connect(&mut h, id);
        h.game.tick(NOW + 321 * 33);

        assert!(h.game.is_finished());
        let outcomes = h.sink.outcomes.lock();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].winner_id, h.a);
        assert_eq!(outcomes[0].reason, MatchEndReason::Forfeit);
    }

    #[test]
    fn test_clamp_aim() {
        let aim = clamp_aim(0.0, PI, 0.35);
        assert!((aim - 0.35).abs() < 1e-5 || (aim - (TAU - 0.35)).abs() < 1e-5);
        assert!((clamp_aim(0.1, 0.2, 0.35) - 0.2).abs() < 1e-5);
        assert!((clamp_aim(0.1, TAU - 0.1, 0.35) - (TAU - 0.1)).abs() < 1e-4);
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let h = harness();
        let registry = MatchRegistry::new();
        assert!(registry.insert(h.handle.clone()));
        assert!(!registry.insert(h.handle.clone()));
        assert_eq!(registry.active_matches(), 1);
        assert!(registry.remove(&h.handle.id).is_some());
        assert!(!registry.contains(&h.handle.id));
    }

    #[tokio::test]
    async fn test_run_loop_streams_state_and_stops() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::channel(256);
        h.handle
            .command_tx
            .send(MatchCommand::Connect {
                player_id: h.a,
                connection_id: h.a_conn,
                sender: tx,
            })
            .await
            .unwrap();

        let handle = h.handle.clone();
        let task = tokio::spawn(h.game.run());

        let welcome = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(welcome, Ok(Some(ServerMsg::Welcome { .. }))));
        let state = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(state, Ok(Some(ServerMsg::State { .. }))));

        handle.stop();
        let finished = tokio::time::timeout(Duration::from_secs(2), task).await;
        tokio_test::assert_ok!(finished);
        assert!(!handle.is_active());
    }
}
