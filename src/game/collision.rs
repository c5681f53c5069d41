//! Static arena geometry and collision queries
//!
//! Walls are plain line segments tested with a parametric segment-segment
//! intersection. With tens of walls and two players there is no broad phase.

use glam::Vec2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Distance kept between a blocked mover and the wall it hit
const WALL_SKIN: f32 = 0.01;
const PARALLEL_EPSILON: f32 = 1e-6;

/// A wall segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wall {
    pub id: u32,
    pub start: Vec2,
    pub end: Vec2,
    #[serde(default = "default_solid")]
    pub solid: bool,
}

fn default_solid() -> bool {
    true
}

/// Axis-aligned arena limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArenaBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl ArenaBounds {
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.max_x > self.min_x
            && self.max_y > self.min_y
    }

    pub fn clamp(&self, point: Vec2) -> Vec2 {
        Vec2::new(
            point.x.clamp(self.min_x, self.max_x),
            point.y.clamp(self.min_y, self.max_y),
        )
    }

    pub fn width(&self) -> f32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f32 {
        self.max_y - self.min_y
    }
}

/// Static map handed over at match creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapData {
    pub walls: Vec<Wall>,
    pub bounds: ArenaBounds,
    /// Spawn points for player one and player two
    #[serde(default)]
    pub spawn_points: Option<[Vec2; 2]>,
}

impl MapData {
    /// Spawn position and facing for the player at `index` (0 or 1)
    pub fn spawn_for(&self, index: usize) -> (Vec2, f32) {
        let b = &self.bounds;
        let center = Vec2::new((b.min_x + b.max_x) * 0.5, (b.min_y + b.max_y) * 0.5);
        let position = match self.spawn_points {
            Some(points) => points[index.min(1)],
            None if index == 0 => Vec2::new(b.min_x + b.width() * 0.25, center.y),
            None => Vec2::new(b.min_x + b.width() * 0.75, center.y),
        };
        let to_center = center - position;
        let facing = if to_center.length_squared() > f32::EPSILON {
            to_center.y.atan2(to_center.x).rem_euclid(std::f32::consts::TAU)
        } else if index == 0 {
            0.0
        } else {
            std::f32::consts::PI
        };
        (position, facing)
    }
}

/// Outcome of moving a player against the walls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementCollision {
    pub collided: bool,
    pub corrected_position: Option<Vec2>,
    pub corrected_velocity: Option<Vec2>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallHit {
    pub hit: bool,
    pub point: Option<Vec2>,
    pub wall_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerHit {
    pub hit: bool,
    pub player_id: Option<Uuid>,
}

/// A player that projectiles may hit
#[derive(Debug, Clone, Copy)]
pub struct HitCandidate {
    pub id: Uuid,
    pub position: Vec2,
    pub radius: f32,
}

/// Nearest crossing along a path
#[derive(Debug, Clone, Copy)]
struct Crossing {
    /// Fraction of the path travelled before the crossing
    t: f32,
    wall_index: usize,
}

/// Collision queries against one match's static geometry
pub struct CollisionSystem {
    walls: Vec<Wall>,
    bounds: ArenaBounds,
}

impl CollisionSystem {
    pub fn new(walls: Vec<Wall>, bounds: ArenaBounds) -> Self {
        Self { walls, bounds }
    }

    pub fn from_map(map: &MapData) -> Self {
        Self::new(map.walls.clone(), map.bounds)
    }

    pub fn bounds(&self) -> &ArenaBounds {
        &self.bounds
    }

    /// Move from `old` towards `candidate`, stopping short of solid walls.
    ///
    /// On contact the mover backs off to just before the wall, then the rest of
    /// the step is projected onto the wall and retried, so diagonal movement
    /// slides instead of sticking. Velocity is projected the same way.
    pub fn validate_player_movement(&self, old: Vec2, candidate: Vec2, velocity: Vec2) -> MovementCollision {
        let Some(crossing) = self.first_crossing(old, candidate) else {
            return MovementCollision {
                collided: false,
                corrected_position: None,
                corrected_velocity: None,
            };
        };

        let wall = &self.walls[crossing.wall_index];
        let stop = keep_clear(back_off(old, candidate - old, crossing.t), old, wall);

        let tangent = (wall.end - wall.start).normalize_or_zero();
        let corrected_velocity = tangent * velocity.dot(tangent);

        let remaining = candidate - stop;
        let slide_target = stop + tangent * remaining.dot(tangent);
        let position = match self.first_crossing(stop, slide_target) {
            None => slide_target,
            Some(second) => keep_clear(
                back_off(stop, slide_target - stop, second.t),
                stop,
                &self.walls[second.wall_index],
            ),
        };

        MovementCollision {
            collided: true,
            corrected_position: Some(position),
            corrected_velocity: Some(corrected_velocity),
        }
    }

    /// Test one projectile micro-step against all solid walls
    pub fn check_projectile_wall_collision(&self, from: Vec2, to: Vec2) -> WallHit {
        match self.first_crossing(from, to) {
            Some(crossing) => WallHit {
                hit: true,
                point: Some(from + (to - from) * crossing.t),
                wall_id: Some(self.walls[crossing.wall_index].id),
            },
            None => WallHit {
                hit: false,
                point: None,
                wall_id: None,
            },
        }
    }

    /// Test a projectile's micro-step against player hit circles.
    ///
    /// The caller filters out the owner and dead players. The first candidate
    /// in iteration order wins.
    pub fn check_projectile_player_collision(
        &self,
        from: Vec2,
        to: Vec2,
        radius: f32,
        candidates: &[HitCandidate],
    ) -> PlayerHit {
        let hit = candidates.iter().find(|candidate| {
            let reach = candidate.radius + radius;
            distance_to_segment(candidate.position, from, to) <= reach
        });

        PlayerHit {
            hit: hit.is_some(),
            player_id: hit.map(|c| c.id),
        }
    }

    /// Distance along a ray to the nearest solid wall, if any lies within `max_distance`
    pub fn raycast_walls(&self, origin: Vec2, direction: Vec2, max_distance: f32) -> Option<(f32, u32)> {
        let end = origin + direction * max_distance;
        self.first_crossing(origin, end)
            .map(|crossing| (crossing.t * max_distance, self.walls[crossing.wall_index].id))
    }

    fn first_crossing(&self, from: Vec2, to: Vec2) -> Option<Crossing> {
        let mut nearest: Option<Crossing> = None;
        for (wall_index, wall) in self.walls.iter().enumerate() {
            if !wall.solid {
                continue;
            }
            // A mover resting exactly on a wall line cannot tell which side it is on
            let side = (wall.end - wall.start).perp_dot(from - wall.start);
            if side == 0.0 {
                continue;
            }
            if let Some(t) = segment_intersection(from, to, wall.start, wall.end) {
                if nearest.map_or(true, |n| t < n.t) {
                    nearest = Some(Crossing { t, wall_index });
                }
            }
        }
        nearest
    }
}

/// Parametric segment test: returns the fraction along `p0 -> p1` where it meets `q0 -> q1`
pub fn segment_intersection(p0: Vec2, p1: Vec2, q0: Vec2, q1: Vec2) -> Option<f32> {
    let r = p1 - p0;
    let s = q1 - q0;
    let denom = r.perp_dot(s);
    if denom.abs() < PARALLEL_EPSILON {
        return None;
    }
    let qp = q0 - p0;
    let t = qp.perp_dot(s) / denom;
    let u = qp.perp_dot(r) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(t)
    } else {
        None
    }
}

/// Shortest distance from `point` to the segment `a -> b`
pub fn distance_to_segment(point: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= f32::EPSILON {
        return point.distance(a);
    }
    let t = ((point - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    point.distance(a + ab * t)
}

/// Point on `origin + path * t`, pulled back by the wall skin
fn back_off(origin: Vec2, path: Vec2, t: f32) -> Vec2 {
    let length = path.length();
    if length <= f32::EPSILON {
        return origin;
    }
    let safe_t = (t - WALL_SKIN / length).max(0.0);
    origin + path * safe_t
}

/// Push `point` away from the wall line until it is at least the skin width
/// away, on the same side as `reference`
fn keep_clear(point: Vec2, reference: Vec2, wall: &Wall) -> Vec2 {
    let Some(dir) = (wall.end - wall.start).try_normalize() else {
        return point;
    };
    let side = dir.perp_dot(reference - wall.start).signum();
    let distance = dir.perp_dot(point - wall.start) * side;
    if distance >= WALL_SKIN {
        return point;
    }
    // perp() of the direction points to the positive perp_dot side
    point + dir.perp() * side * (WALL_SKIN - distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wall(id: u32, sx: f32, sy: f32, ex: f32, ey: f32) -> Wall {
        Wall {
            id,
            start: Vec2::new(sx, sy),
            end: Vec2::new(ex, ey),
            solid: true,
        }
    }

    fn vertical_wall_system() -> CollisionSystem {
        CollisionSystem::new(
            vec![wall(1, 5.0, -10.0, 5.0, 10.0)],
            ArenaBounds::new(-20.0, -20.0, 20.0, 20.0),
        )
    }

    #[test]
    fn test_free_path_is_untouched() {
        let system = vertical_wall_system();
        let result = system.validate_player_movement(Vec2::ZERO, Vec2::new(3.0, 0.0), Vec2::X);
        assert!(!result.collided);
        assert!(result.corrected_position.is_none());
    }

    #[test]
    fn test_blocked_path_stops_before_wall() {
        let system = vertical_wall_system();
        let result = system.validate_player_movement(Vec2::ZERO, Vec2::new(8.0, 0.0), Vec2::new(5.0, 0.0));
        assert!(result.collided);
        let pos = result.corrected_position.unwrap();
        assert!(pos.x < 5.0);
        assert!(pos.x > 4.9);
        // Head-on contact has nothing to slide along
        assert!(result.corrected_velocity.unwrap().length() < 1e-5);
    }

    #[test]
    fn test_diagonal_movement_slides() {
        let system = vertical_wall_system();
        let result =
            system.validate_player_movement(Vec2::new(4.0, 0.0), Vec2::new(6.0, 2.0), Vec2::new(3.0, 3.0));
        assert!(result.collided);
        let pos = result.corrected_position.unwrap();
        assert!(pos.x < 5.0);
        assert!(pos.y > 1.5);
        let vel = result.corrected_velocity.unwrap();
        assert!(vel.x.abs() < 1e-5);
        assert!((vel.y - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_solid_walls_are_ignored() {
        let mut decorative = wall(2, 5.0, -10.0, 5.0, 10.0);
        decorative.solid = false;
        let system = CollisionSystem::new(vec![decorative], ArenaBounds::new(-20.0, -20.0, 20.0, 20.0));
        let result = system.validate_player_movement(Vec2::ZERO, Vec2::new(8.0, 0.0), Vec2::X);
        assert!(!result.collided);
    }

    #[test]
    fn test_projectile_wall_hit_reports_point_and_id() {
        let system = vertical_wall_system();
        let hit = system.check_projectile_wall_collision(Vec2::new(4.0, 1.0), Vec2::new(6.0, 1.0));
        assert!(hit.hit);
        assert_eq!(hit.wall_id, Some(1));
        let point = hit.point.unwrap();
        assert!((point.x - 5.0).abs() < 1e-4);
        assert!((point.y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_projectile_player_hit_uses_swept_step() {
        let system = vertical_wall_system();
        let target = HitCandidate {
            id: Uuid::new_v4(),
            position: Vec2::new(1.0, 0.0),
            radius: 0.5,
        };
        // Both endpoints are outside the circle but the step passes through it
        let hit = system.check_projectile_player_collision(Vec2::new(0.0, 0.0), Vec2::new(2.0, 0.0), 0.1, &[target]);
        assert!(hit.hit);
        assert_eq!(hit.player_id, Some(target.id));

        let miss = system.check_projectile_player_collision(Vec2::new(0.0, 2.0), Vec2::new(2.0, 2.0), 0.1, &[target]);
        assert!(!miss.hit);
    }

    #[test]
    fn test_raycast_distance() {
        let system = vertical_wall_system();
        let (distance, wall_id) = system.raycast_walls(Vec2::ZERO, Vec2::X, 10.0).unwrap();
        assert!((distance - 5.0).abs() < 1e-4);
        assert_eq!(wall_id, 1);
        assert!(system.raycast_walls(Vec2::ZERO, Vec2::X, 4.0).is_none());
    }

    #[test]
    fn test_default_spawns_face_each_other() {
        let map = MapData {
            walls: vec![],
            bounds: ArenaBounds::new(0.0, 0.0, 20.0, 10.0),
            spawn_points: None,
        };
        let (p1, f1) = map.spawn_for(0);
        let (p2, f2) = map.spawn_for(1);
        assert_eq!(p1, Vec2::new(5.0, 5.0));
        assert_eq!(p2, Vec2::new(15.0, 5.0));
        assert!(f1.abs() < 1e-5);
        assert!((f2 - std::f32::consts::PI).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn prop_never_crosses_a_wall(
            start_x in -9.0f32..4.0,
            start_y in -9.0f32..9.0,
            steps in proptest::collection::vec((0.0f32..std::f32::consts::TAU, 0.5f32..6.0), 1..40),
        ) {
            // Box of walls with a divider at x = 5
            let system = CollisionSystem::new(
                vec![
                    wall(1, -10.0, -10.0, 10.0, -10.0),
                    wall(2, 10.0, -10.0, 10.0, 10.0),
                    wall(3, 10.0, 10.0, -10.0, 10.0),
                    wall(4, -10.0, 10.0, -10.0, -10.0),
                    wall(5, 5.0, -10.0, 5.0, 10.0),
                ],
                ArenaBounds::new(-10.0, -10.0, 10.0, 10.0),
            );
            let mut pos = Vec2::new(start_x, start_y);
            for (angle, distance) in steps {
                let step = Vec2::from_angle(angle) * distance;
                let result = system.validate_player_movement(pos, pos + step, step);
                pos = result.corrected_position.unwrap_or(pos + step);
                prop_assert!(pos.x < 5.0, "crossed divider: {:?}", pos);
                prop_assert!(pos.x > -10.0 && pos.y > -10.0 && pos.y < 10.0, "left the box: {:?}", pos);
            }
        }
    }
}
