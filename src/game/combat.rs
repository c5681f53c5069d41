//! Class archetypes, weapon profiles and damage resolution

use serde::{Deserialize, Serialize};

use crate::ws::protocol::ClassType;

/// How a weapon delivers its damage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectileKind {
    /// Travelling projectile advanced over multiple ticks
    Arrow,
    /// Instant ray resolved in the tick it was fired
    Hitscan,
}

/// Weapon stats per class
#[derive(Debug, Clone, Copy)]
pub struct WeaponProfile {
    /// Damage per hit before armor
    pub damage: f32,
    /// Projectile speed in units per second (0 = hitscan)
    pub projectile_speed: f32,
    /// Maximum travel distance
    pub range: f32,
    /// Cooldown between shots (milliseconds)
    pub cooldown_ms: u64,
    /// Keeps flying after hitting a player that survives
    pub piercing: bool,
    /// Re-aims at the enemy every tick
    pub homing: bool,
    /// Percentage of the target's armor ignored (0-100)
    pub armor_penetration: f32,
    /// Projectile hit radius
    pub projectile_radius: f32,
    /// Ballistic projectiles expire after this many seconds regardless of distance
    pub max_lifetime: f32,
}

impl WeaponProfile {
    pub fn for_class(class_type: ClassType) -> Self {
        match class_type {
            ClassType::Archer => Self {
                damage: 35.0,
                projectile_speed: 20.0,
                range: 30.0,
                cooldown_ms: 600,
                piercing: false,
                homing: false,
                armor_penetration: 20.0,
                projectile_radius: 0.1,
                max_lifetime: 3.0,
            },
            ClassType::Mage => Self {
                damage: 25.0,
                projectile_speed: 12.0,
                range: 20.0,
                cooldown_ms: 800,
                piercing: false,
                homing: true,
                armor_penetration: 0.0,
                projectile_radius: 0.2,
                max_lifetime: 3.0,
            },
            ClassType::Gunslinger => Self {
                damage: 40.0,
                projectile_speed: 0.0,
                range: 10.0,
                cooldown_ms: 700,
                piercing: false,
                homing: false,
                armor_penetration: 50.0,
                projectile_radius: 0.0,
                max_lifetime: 0.0,
            },
            ClassType::Warden => Self {
                damage: 45.0,
                projectile_speed: 18.0,
                range: 25.0,
                cooldown_ms: 1200,
                piercing: true,
                homing: false,
                armor_penetration: 30.0,
                projectile_radius: 0.15,
                max_lifetime: 3.0,
            },
        }
    }

    pub fn kind(&self) -> ProjectileKind {
        if self.projectile_speed <= 0.0 {
            ProjectileKind::Hitscan
        } else {
            ProjectileKind::Arrow
        }
    }
}

/// Body stats per class
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub max_health: i32,
    pub armor: f32,
    /// Player hit circle radius
    pub hit_radius: f32,
}

impl ClassStats {
    pub fn for_class(class_type: ClassType) -> Self {
        match class_type {
            ClassType::Archer => Self {
                max_health: 100,
                armor: 20.0,
                hit_radius: 0.5,
            },
            ClassType::Mage => Self {
                max_health: 90,
                armor: 10.0,
                hit_radius: 0.5,
            },
            ClassType::Gunslinger => Self {
                max_health: 100,
                armor: 0.0,
                hit_radius: 0.5,
            },
            ClassType::Warden => Self {
                max_health: 120,
                armor: 40.0,
                hit_radius: 0.55,
            },
        }
    }
}

/// Resolve damage against armor.
///
/// Effective armor is reduced by the attacker's penetration, converted into a
/// diminishing reduction fraction, and the result never drops below 1.
pub fn calculate_damage(base_damage: f32, armor: f32, armor_penetration: f32) -> i32 {
    let armor = armor.max(0.0);
    let penetration = armor_penetration.clamp(0.0, 100.0);
    let effective_armor = armor * (1.0 - penetration / 100.0);
    let reduction = effective_armor / (effective_armor + 100.0);
    let damage = (base_damage * (1.0 - reduction)).round();
    (damage as i32).max(1)
}

/// Apply damage to health, returns (new_health, is_dead)
pub fn apply_damage(current_health: i32, damage: i32) -> (i32, bool) {
    let new_health = (current_health - damage).max(0);
    (new_health, new_health <= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_no_armor_means_full_damage() {
        assert_eq!(calculate_damage(40.0, 0.0, 50.0), 40);
        assert_eq!(calculate_damage(40.0, 0.0, 0.0), 40);
    }

    #[test]
    fn test_armor_reduces_damage() {
        // 100 armor halves the damage
        assert_eq!(calculate_damage(40.0, 100.0, 0.0), 20);
        // 50% penetration leaves 50 effective armor: 40 * (1 - 50/150)
        assert_eq!(calculate_damage(40.0, 100.0, 50.0), 27);
    }

    #[test]
    fn test_huge_armor_still_deals_one() {
        assert_eq!(calculate_damage(5.0, 1_000_000.0, 0.0), 1);
        assert_eq!(calculate_damage(0.0, 0.0, 0.0), 1);
    }

    #[test]
    fn test_apply_damage_floors_at_zero() {
        assert_eq!(apply_damage(30, 40), (0, true));
        assert_eq!(apply_damage(100, 40), (60, false));
    }

    #[test]
    fn test_weapon_kind_follows_speed() {
        assert_eq!(WeaponProfile::for_class(ClassType::Gunslinger).kind(), ProjectileKind::Hitscan);
        assert_eq!(WeaponProfile::for_class(ClassType::Archer).kind(), ProjectileKind::Arrow);
    }

    proptest! {
        #[test]
        fn prop_damage_at_least_one(
            base in 0.0f32..500.0,
            armor in 0.0f32..10_000.0,
            pen in 0.0f32..=100.0,
        ) {
            prop_assert!(calculate_damage(base, armor, pen) >= 1);
        }

        #[test]
        fn prop_damage_non_increasing_in_armor(
            base in 0.0f32..500.0,
            armor in 0.0f32..5_000.0,
            extra in 0.0f32..5_000.0,
            pen in 0.0f32..=100.0,
        ) {
            let low = calculate_damage(base, armor, pen);
            let high = calculate_damage(base, armor + extra, pen);
            prop_assert!(high <= low);
        }
    }
}
