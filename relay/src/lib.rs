//! gTunnel Relay
//!
//! Accepts agent tunnels over WebSocket and bridges public HTTP requests to
//! them by the first path segment.

pub mod bridge;
pub mod config;
pub mod handshake;
pub mod headers;
pub mod registry;
pub mod router;
pub mod server;
pub mod tunnel;

pub use config::RelayConfig;
pub use server::{app, serve, AppState};
