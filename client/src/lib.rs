//! gTunnel agent
//!
//! Connects to a gTunnel relay over WebSocket and serves the HTTP requests
//! it forwards by calling a service on the local machine.

pub mod agent;
pub mod config;
pub mod proxy;
pub mod status;

pub use agent::{connect, AgentError, Session};
pub use config::{AgentConfig, ClientConfig};
pub use proxy::LocalService;
