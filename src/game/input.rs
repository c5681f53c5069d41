//! Player input commands and anti-cheat validation
//!
//! Transport hands raw [`ClientMsg`]s to the match; they are turned into
//! [`InputCommand`]s, validated on arrival and buffered per player until the
//! next tick drains them in client sequence order.

use glam::Vec2;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::MatchConfig;
use crate::ws::protocol::ClientMsg;

/// What a player asked to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputAction {
    Move { forward: f32, strafe: f32, sprint: bool },
    Look { angle_delta: f32 },
    Attack { direction: f32, target_position: Option<Vec2> },
    Ability { slot: u8 },
}

impl InputAction {
    fn kind_index(&self) -> usize {
        match self {
            Self::Move { .. } => 0,
            Self::Look { .. } => 1,
            Self::Attack { .. } => 2,
            Self::Ability { .. } => 3,
        }
    }

    fn is_finite(&self) -> bool {
        match *self {
            Self::Move { forward, strafe, .. } => forward.is_finite() && strafe.is_finite(),
            Self::Look { angle_delta } => angle_delta.is_finite(),
            Self::Attack {
                direction,
                target_position,
            } => direction.is_finite() && target_position.map_or(true, |p| p.is_finite()),
            Self::Ability { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputCommand {
    pub sequence: u32,
    /// Client clock (Unix millis)
    pub client_timestamp: u64,
    /// Server clock when the message arrived (Unix millis)
    pub received_at: u64,
    pub action: InputAction,
}

impl InputCommand {
    /// Convert a gameplay message; control messages (ping, resync) yield `None`
    pub fn from_client_msg(msg: &ClientMsg, received_at: u64) -> Option<Self> {
        let (sequence, client_timestamp, action) = match *msg {
            ClientMsg::Movement {
                sequence_id,
                timestamp,
                data,
            } => (
                sequence_id,
                timestamp,
                InputAction::Move {
                    forward: data.forward,
                    strafe: data.strafe,
                    sprint: data.sprint,
                },
            ),
            ClientMsg::Look {
                sequence_id,
                timestamp,
                data,
            } => (
                sequence_id,
                timestamp,
                InputAction::Look {
                    angle_delta: data.angle_delta,
                },
            ),
            ClientMsg::Attack {
                sequence_id,
                timestamp,
                data,
            } => (
                sequence_id,
                timestamp,
                InputAction::Attack {
                    direction: data.direction,
                    target_position: data.target_position,
                },
            ),
            ClientMsg::Ability {
                sequence_id,
                timestamp,
                data,
            } => (sequence_id, timestamp, InputAction::Ability { slot: data.slot }),
            ClientMsg::Ping { .. } | ClientMsg::RequestResync { .. } => return None,
        };

        Some(Self {
            sequence,
            client_timestamp,
            received_at,
            action,
        })
    }
}

/// Why an input was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRejection {
    Stale,
    RateLimited,
    Malformed,
    Duplicate,
    OverBudget,
}

/// Per-player anti-cheat counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputStats {
    pub accepted: u64,
    pub stale: u64,
    pub rate_limited: u64,
    pub malformed: u64,
    pub duplicate: u64,
    pub over_budget: u64,
}

impl InputStats {
    pub fn rejected(&self) -> u64 {
        self.stale + self.rate_limited + self.malformed + self.duplicate + self.over_budget
    }

    fn record(&mut self, rejection: InputRejection) {
        match rejection {
            InputRejection::Stale => self.stale += 1,
            InputRejection::RateLimited => self.rate_limited += 1,
            InputRejection::Malformed => self.malformed += 1,
            InputRejection::Duplicate => self.duplicate += 1,
            InputRejection::OverBudget => self.over_budget += 1,
        }
    }
}

/// Arrival-time checks for one player's inputs
pub struct InputValidator {
    max_input_age_ms: u64,
    min_input_interval_ms: u64,
    /// Last accepted arrival per action kind. A client sends move, look and
    /// attack in the same frame, so spacing is enforced per kind.
    last_accepted_at: [Option<u64>; 4],
    stats: InputStats,
}

impl InputValidator {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            max_input_age_ms: config.max_input_age_ms,
            min_input_interval_ms: config.min_input_interval_ms,
            last_accepted_at: [None; 4],
            stats: InputStats::default(),
        }
    }

    pub fn validate(&mut self, command: &InputCommand) -> Result<(), InputRejection> {
        let result = self.check(command);
        match result {
            Ok(()) => {
                self.last_accepted_at[command.action.kind_index()] = Some(command.received_at);
                self.stats.accepted += 1;
            }
            Err(rejection) => self.stats.record(rejection),
        }
        result
    }

    fn check(&self, command: &InputCommand) -> Result<(), InputRejection> {
        if !command.action.is_finite() {
            return Err(InputRejection::Malformed);
        }
        if command.received_at.saturating_sub(command.client_timestamp) > self.max_input_age_ms {
            return Err(InputRejection::Stale);
        }
        if let Some(last) = self.last_accepted_at[command.action.kind_index()] {
            if command.received_at.saturating_sub(last) < self.min_input_interval_ms {
                return Err(InputRejection::RateLimited);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> InputStats {
        self.stats
    }
}

/// Validated inputs waiting for the next tick
pub struct InputQueue {
    player_id: Uuid,
    pending: Vec<InputCommand>,
    validator: InputValidator,
    last_drained_sequence: Option<u32>,
}

impl InputQueue {
    pub fn new(player_id: Uuid, config: &MatchConfig) -> Self {
        Self {
            player_id,
            pending: Vec::new(),
            validator: InputValidator::new(config),
            last_drained_sequence: None,
        }
    }

    /// Validate and buffer a command; rejected commands are dropped silently
    pub fn push(&mut self, command: InputCommand) -> bool {
        match self.validator.validate(&command) {
            Ok(()) => {
                self.pending.push(command);
                true
            }
            Err(rejection) => {
                debug!(
                    player_id = %self.player_id,
                    sequence = command.sequence,
                    reason = ?rejection,
                    "Input rejected"
                );
                false
            }
        }
    }

    /// Take this tick's commands in ascending sequence order.
    ///
    /// Sequences at or below the last drained one are duplicates. Movement
    /// beyond `movement_budget` is dropped. The returned highest sequence
    /// covers dropped movement too, so the client stops predicting it.
    pub fn drain_ordered(&mut self, movement_budget: usize) -> (Vec<InputCommand>, Option<u32>) {
        let mut commands = std::mem::take(&mut self.pending);
        commands.sort_by_key(|c| c.sequence);

        let mut accepted = Vec::with_capacity(commands.len());
        let mut highest = None;
        let mut movements = 0;

        for command in commands {
            let seen = self
                .last_drained_sequence
                .is_some_and(|last| command.sequence <= last);
            if seen {
                self.reject(&command, InputRejection::Duplicate);
                continue;
            }
            self.last_drained_sequence = Some(command.sequence);
            highest = Some(command.sequence);

            if matches!(command.action, InputAction::Move { .. }) {
                if movements >= movement_budget {
                    self.reject(&command, InputRejection::OverBudget);
                    continue;
                }
                movements += 1;
            }
            accepted.push(command);
        }

        (accepted, highest)
    }

    pub fn stats(&self) -> InputStats {
        self.validator.stats()
    }

    fn reject(&mut self, command: &InputCommand, rejection: InputRejection) {
        debug!(
            player_id = %self.player_id,
            sequence = command.sequence,
            reason = ?rejection,
            "Input dropped at tick"
        );
        self.validator.stats.accepted = self.validator.stats.accepted.saturating_sub(1);
        self.validator.stats.record(rejection);
    }
}
