//! WebSocket transport: wire protocol and per-connection sessions

pub mod handler;
pub mod protocol;
