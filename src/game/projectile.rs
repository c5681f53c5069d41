//! Projectile physics - ballistic flight, homing and hitscan rays

use std::collections::BTreeMap;

use glam::Vec2;
use uuid::Uuid;

use crate::ws::protocol::ClassType;

use super::collision::CollisionSystem;
use super::combat::{ClassStats, ProjectileKind, WeaponProfile};

/// Active projectile in the game
#[derive(Debug, Clone, PartialEq)]
pub struct Projectile {
    pub id: u64,
    pub owner_id: Uuid,
    pub kind: ProjectileKind,
    pub position: Vec2,
    /// Position at the start of the last step (for swept collision tests)
    pub previous_position: Vec2,
    pub velocity: Vec2,
    pub damage: f32,
    pub radius: f32,
    pub piercing: bool,
    pub homing: bool,
    pub target_id: Option<Uuid>,
    pub armor_penetration: f32,
    pub range: f32,
    pub max_lifetime: f32,
    /// Server time the projectile was fired (Unix millis)
    pub spawn_time: u64,
    /// Seconds in flight
    pub age: f32,
    pub distance_traveled: f32,
    pub active: bool,
    /// Players a piercing projectile already damaged
    pub hit_players: Vec<Uuid>,
}

/// Where a homing projectile should steer
#[derive(Debug, Clone, Copy)]
pub struct HomingTarget {
    pub id: Uuid,
    pub position: Vec2,
    pub alive: bool,
}

/// Result of advancing all projectiles one step
#[derive(Debug, Default)]
pub struct ProjectileStep {
    pub updated: Vec<Projectile>,
    pub expired: Vec<u64>,
}

/// A player a hitscan ray may hit
#[derive(Debug, Clone, Copy)]
pub struct RayTarget {
    pub id: Uuid,
    pub position: Vec2,
    pub radius: f32,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitType {
    Player,
    Wall,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitscanResult {
    pub hit_type: HitType,
    pub hit_player_id: Option<Uuid>,
    pub hit_position: Vec2,
    pub distance: f32,
}

/// Projectile physics system.
///
/// Holds no entities: callers pass the projectile map in and commit the
/// returned copies through the game state.
pub struct ProjectilePhysics;

impl ProjectilePhysics {
    /// Spawn a ballistic projectile for the owner's class, offset past the
    /// owner's hit circle so it cannot hit the shooter on the first step
    pub fn create_projectile(
        id: u64,
        owner_id: Uuid,
        position: Vec2,
        angle: f32,
        class_type: ClassType,
        target_id: Option<Uuid>,
        now: u64,
    ) -> Projectile {
        let weapon = WeaponProfile::for_class(class_type);
        let body = ClassStats::for_class(class_type);
        let direction = Vec2::from_angle(angle);
        let spawn = position + direction * (body.hit_radius + weapon.projectile_radius);

        Projectile {
            id,
            owner_id,
            kind: weapon.kind(),
            position: spawn,
            previous_position: spawn,
            velocity: direction * weapon.projectile_speed,
            damage: weapon.damage,
            radius: weapon.projectile_radius,
            piercing: weapon.piercing,
            homing: weapon.homing,
            target_id: if weapon.homing { target_id } else { None },
            armor_penetration: weapon.armor_penetration,
            range: weapon.range,
            max_lifetime: weapon.max_lifetime,
            spawn_time: now,
            age: 0.0,
            distance_traveled: 0.0,
            active: true,
            hit_players: Vec::new(),
        }
    }

    /// Cast a ray and return the nearest wall or living non-shooter player
    pub fn process_hitscan_weapon(
        origin: Vec2,
        angle: f32,
        max_range: f32,
        shooter_id: Uuid,
        targets: &[RayTarget],
        collision: &CollisionSystem,
    ) -> HitscanResult {
        let direction = Vec2::from_angle(angle);
        let mut nearest = HitscanResult {
            hit_type: HitType::None,
            hit_player_id: None,
            hit_position: origin + direction * max_range,
            distance: max_range,
        };

        if let Some((distance, _wall_id)) = collision.raycast_walls(origin, direction, max_range) {
            nearest = HitscanResult {
                hit_type: HitType::Wall,
                hit_player_id: None,
                hit_position: origin + direction * distance,
                distance,
            };
        }

        for target in targets.iter().filter(|t| t.alive && t.id != shooter_id) {
            if let Some(distance) = ray_circle_distance(origin, direction, target.position, target.radius) {
                if distance <= nearest.distance {
                    nearest = HitscanResult {
                        hit_type: HitType::Player,
                        hit_player_id: Some(target.id),
                        hit_position: origin + direction * distance,
                        distance,
                    };
                }
            }
        }

        nearest
    }

    /// Advance every active projectile by `delta_time`.
    ///
    /// Homing projectiles re-aim straight at their target's current position
    /// each step, keeping their speed.
    pub fn update_projectiles(
        projectiles: &BTreeMap<u64, Projectile>,
        targets: &[HomingTarget],
        delta_time: f32,
    ) -> ProjectileStep {
        let mut step = ProjectileStep::default();

        for projectile in projectiles.values().filter(|p| p.active) {
            let mut next = projectile.clone();

            if next.homing {
                let target = next
                    .target_id
                    .and_then(|id| targets.iter().find(|t| t.id == id && t.alive));
                if let Some(target) = target {
                    let speed = next.velocity.length();
                    if let Some(direction) = (target.position - next.position).try_normalize() {
                        next.velocity = direction * speed;
                    }
                }
            }

            let travel = next.velocity * delta_time;
            next.previous_position = next.position;
            next.position += travel;
            next.distance_traveled += travel.length();
            next.age += delta_time;

            if next.distance_traveled >= next.range || next.age >= next.max_lifetime {
                step.expired.push(next.id);
            } else {
                step.updated.push(next);
            }
        }

        step
    }
}

/// Distance along a unit ray to the first point inside a circle
fn ray_circle_distance(origin: Vec2, direction: Vec2, center: Vec2, radius: f32) -> Option<f32> {
    let to_center = center - origin;
    if to_center.length_squared() <= radius * radius {
        return Some(0.0);
    }
    let along = to_center.dot(direction);
    if along < 0.0 {
        return None;
    }
    let closest_sq = to_center.length_squared() - along * along;
    let radius_sq = radius * radius;
    if closest_sq > radius_sq {
        return None;
    }
    Some(along - (radius_sq - closest_sq).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::collision::{ArenaBounds, Wall};

    fn open_arena() -> CollisionSystem {
        CollisionSystem::new(vec![], ArenaBounds::new(-50.0, -50.0, 50.0, 50.0))
    }

    fn target(id: Uuid, x: f32, y: f32) -> RayTarget {
        RayTarget {
            id,
            position: Vec2::new(x, y),
            radius: 0.5,
            alive: true,
        }
    }

    #[test]
    fn test_hitscan_hits_player_in_line() {
        let shooter = Uuid::new_v4();
        let victim = Uuid::new_v4();
        let targets = [target(shooter, 0.0, 0.0), target(victim, 5.0, 0.0)];

        let result = ProjectilePhysics::process_hitscan_weapon(Vec2::ZERO, 0.0, 10.0, shooter, &targets, &open_arena());

        assert_eq!(result.hit_type, HitType::Player);
        assert_eq!(result.hit_player_id, Some(victim));
        assert!((result.distance - 4.5).abs() < 1e-4);
    }

    #[test]
    fn test_hitscan_out_of_range_misses() {
        let shooter = Uuid::new_v4();
        let targets = [target(Uuid::new_v4(), 20.0, 0.0)];
        let result = ProjectilePhysics::process_hitscan_weapon(Vec2::ZERO, 0.0, 10.0, shooter, &targets, &open_arena());
        assert_eq!(result.hit_type, HitType::None);
        assert!((result.hit_position.x - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_hitscan_blocked_by_wall() {
        let collision = CollisionSystem::new(
            vec![Wall {
                id: 9,
                start: Vec2::new(3.0, -5.0),
                end: Vec2::new(3.0, 5.0),
                solid: true,
            }],
            ArenaBounds::new(-50.0, -50.0, 50.0, 50.0),
        );
        let shooter = Uuid::new_v4();
        let targets = [target(Uuid::new_v4(), 5.0, 0.0)];
        let result = ProjectilePhysics::process_hitscan_weapon(Vec2::ZERO, 0.0, 10.0, shooter, &targets, &collision);
        assert_eq!(result.hit_type, HitType::Wall);
        assert!((result.distance - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_hitscan_ignores_dead_players() {
        let shooter = Uuid::new_v4();
        let mut dead = target(Uuid::new_v4(), 5.0, 0.0);
        dead.alive = false;
        let result = ProjectilePhysics::process_hitscan_weapon(Vec2::ZERO, 0.0, 10.0, shooter, &[dead], &open_arena());
        assert_eq!(result.hit_type, HitType::None);
    }

    #[test]
    fn test_projectile_spawns_outside_owner() {
        let owner = Uuid::new_v4();
        let projectile = ProjectilePhysics::create_projectile(1, owner, Vec2::ZERO, 0.0, ClassType::Archer, None, 0);
        let body = ClassStats::for_class(ClassType::Archer);
        assert!(projectile.position.x > body.hit_radius);
        assert_eq!(projectile.kind, ProjectileKind::Arrow);
        assert!(projectile.target_id.is_none());
    }

    #[test]
    fn test_projectiles_advance_and_expire() {
        let owner = Uuid::new_v4();
        let mut map = BTreeMap::new();
        let mut short = ProjectilePhysics::create_projectile(1, owner, Vec2::ZERO, 0.0, ClassType::Archer, None, 0);
        short.distance_traveled = short.range - 0.1;
        let fresh = ProjectilePhysics::create_projectile(2, owner, Vec2::ZERO, 0.0, ClassType::Archer, None, 0);
        map.insert(1, short);
        map.insert(2, fresh.clone());

        let step = ProjectilePhysics::update_projectiles(&map, &[], 1.0 / 30.0);

        assert_eq!(step.expired, vec![1]);
        assert_eq!(step.updated.len(), 1);
        let moved = &step.updated[0];
        assert!(moved.position.x > fresh.position.x);
        assert_eq!(moved.previous_position, fresh.position);
    }

    #[test]
    fn test_homing_snaps_to_target() {
        let owner = Uuid::new_v4();
        let victim = Uuid::new_v4();
        let projectile =
            ProjectilePhysics::create_projectile(1, owner, Vec2::ZERO, 0.0, ClassType::Mage, Some(victim), 0);
        let speed = projectile.velocity.length();
        let map = BTreeMap::from([(1, projectile)]);
        let targets = [HomingTarget {
            id: victim,
            position: Vec2::new(0.0, 10.0),
            alive: true,
        }];

        let step = ProjectilePhysics::update_projectiles(&map, &targets, 1.0 / 30.0);
        let steered = &step.updated[0];
        assert!(steered.velocity.y > 0.0);
        assert!((steered.velocity.length() - speed).abs() < 1e-3);
    }
}
