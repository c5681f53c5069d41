//! Player movement from directional intent
//!
//! Pure functions only: the same inputs must produce bit-identical outputs on
//! the server and in client prediction, so nothing here reads clocks or RNG.

use glam::Vec2;

use super::collision::ArenaBounds;

/// Base movement speed in units per second
pub const BASE_SPEED: f32 = 5.0;
/// Speed multiplier while sprinting
pub const SPRINT_MULTIPLIER: f32 = 1.5;
/// Input magnitudes below this are treated as no input
pub const MOVEMENT_THRESHOLD: f32 = 0.1;

/// Directional intent plus the facing it is relative to
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MovementIntent {
    pub forward: f32,
    pub strafe: f32,
    pub sprint: bool,
    pub facing_angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementResult {
    pub position: Vec2,
    pub velocity: Vec2,
}

/// Integrate one movement step.
///
/// Forward follows the facing angle, strafe is perpendicular to it. Diagonal
/// input is normalized so it never beats straight-line speed.
pub fn calculate_movement(position: Vec2, intent: &MovementIntent, delta_time: f32) -> MovementResult {
    let forward = intent.forward.clamp(-1.0, 1.0);
    let strafe = intent.strafe.clamp(-1.0, 1.0);

    let magnitude = (forward * forward + strafe * strafe).sqrt();
    if magnitude < MOVEMENT_THRESHOLD {
        return MovementResult {
            position,
            velocity: Vec2::ZERO,
        };
    }

    let scale = if magnitude > 1.0 { 1.0 / magnitude } else { 1.0 };
    let facing = Vec2::from_angle(intent.facing_angle);
    let right = facing.perp();
    let direction = facing * (forward * scale) + right * (strafe * scale);

    let speed = if intent.sprint {
        BASE_SPEED * SPRINT_MULTIPLIER
    } else {
        BASE_SPEED
    };
    let velocity = direction * speed;

    MovementResult {
        position: position + velocity * delta_time,
        velocity,
    }
}

/// Clamp a candidate position into the arena bounds, if the arena has any
pub fn validate_movement(_old_position: Vec2, candidate: Vec2, bounds: Option<&ArenaBounds>) -> Vec2 {
    match bounds {
        Some(bounds) => bounds.clamp(candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DT: f32 = 1.0 / 30.0;

    fn intent(forward: f32, strafe: f32, sprint: bool, facing_angle: f32) -> MovementIntent {
        MovementIntent {
            forward,
            strafe,
            sprint,
            facing_angle,
        }
    }

    #[test]
    fn test_forward_moves_along_facing() {
        let result = calculate_movement(Vec2::ZERO, &intent(1.0, 0.0, false, 0.0), 1.0);
        assert!((result.position.x - BASE_SPEED).abs() < 1e-5);
        assert!(result.position.y.abs() < 1e-5);
    }

    #[test]
    fn test_diagonal_is_normalized() {
        let straight = calculate_movement(Vec2::ZERO, &intent(1.0, 0.0, false, 0.3), DT);
        let diagonal = calculate_movement(Vec2::ZERO, &intent(1.0, 1.0, false, 0.3), DT);
        assert!((diagonal.velocity.length() - straight.velocity.length()).abs() < 1e-4);
    }

    #[test]
    fn test_sprint_multiplies_speed() {
        let walk = calculate_movement(Vec2::ZERO, &intent(1.0, 0.0, false, 0.0), DT);
        let sprint = calculate_movement(Vec2::ZERO, &intent(1.0, 0.0, true, 0.0), DT);
        assert!((sprint.velocity.length() - walk.velocity.length() * SPRINT_MULTIPLIER).abs() < 1e-4);
    }

    #[test]
    fn test_small_input_is_ignored() {
        let start = Vec2::new(3.0, 4.0);
        let result = calculate_movement(start, &intent(0.05, 0.05, true, 1.0), DT);
        assert_eq!(result.position, start);
        assert_eq!(result.velocity, Vec2::ZERO);
    }

    #[test]
    fn test_validate_clamps_into_bounds() {
        let bounds = ArenaBounds::new(0.0, 0.0, 10.0, 10.0);
        let clamped = validate_movement(Vec2::ZERO, Vec2::new(12.0, -1.0), Some(&bounds));
        assert_eq!(clamped, Vec2::new(10.0, 0.0));
        let free = validate_movement(Vec2::ZERO, Vec2::new(12.0, -1.0), None);
        assert_eq!(free, Vec2::new(12.0, -1.0));
    }

    proptest! {
        #[test]
        fn prop_movement_is_deterministic(
            x in -100.0f32..100.0,
            y in -100.0f32..100.0,
            forward in -1.0f32..=1.0,
            strafe in -1.0f32..=1.0,
            sprint in any::<bool>(),
            angle in 0.0f32..std::f32::consts::TAU,
        ) {
            let start = Vec2::new(x, y);
            let input = intent(forward, strafe, sprint, angle);
            let a = calculate_movement(start, &input, DT);
            let b = calculate_movement(start, &input, DT);
            prop_assert_eq!(a.position.x.to_bits(), b.position.x.to_bits());
            prop_assert_eq!(a.position.y.to_bits(), b.position.y.to_bits());
            prop_assert_eq!(a.velocity.x.to_bits(), b.velocity.x.to_bits());
            prop_assert_eq!(a.velocity.y.to_bits(), b.velocity.y.to_bits());
        }

        #[test]
        fn prop_speed_never_exceeds_sprint_speed(
            forward in -1.0f32..=1.0,
            strafe in -1.0f32..=1.0,
            angle in 0.0f32..std::f32::consts::TAU,
        ) {
            let result = calculate_movement(Vec2::ZERO, &intent(forward, strafe, true, angle), DT);
            prop_assert!(result.velocity.length() <= BASE_SPEED * SPRINT_MULTIPLIER + 1e-3);
        }
    }
}
