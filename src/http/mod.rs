//! HTTP surface: health, matchmaking handoff and the WebSocket upgrade

pub mod routes;

pub use routes::{build_router, AppError};
