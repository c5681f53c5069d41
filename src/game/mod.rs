//! Game simulation modules

pub mod collision;
pub mod combat;
pub mod delta;
pub mod input;
pub mod r#match;
pub mod movement;
pub mod projectile;
pub mod round;
pub mod state;

pub use r#match::{GameMatch, MatchCommand, MatchHandle, MatchRegistry};
