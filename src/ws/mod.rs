//! WebSocket layer: upgrade handler, per-socket loop and protocol types.
//!
//! The endpoint at `/ws` authenticates the handshake, then streams widget
//! updates, snapshots and heartbeats to the dashboard.

pub mod connection;
pub mod handler;
pub mod messages;
