//! Matchmaking integration: handoff validation and match lifecycle

pub mod handoff;
pub mod service;

pub use handoff::{HandoffError, MatchHandoff};
pub use service::MatchService;
