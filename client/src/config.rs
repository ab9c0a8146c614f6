//! Configuration for the gTunnel agent
//!
//! `client.yaml` remembers the relay URL and access token between runs;
//! [`AgentConfig`] is what a single tunnel session actually runs with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gtunnel_shared::protocol::{AUTH_TIMEOUT, KEEPALIVE_INTERVAL, RESPONSE_TIMEOUT, WS_PATH};

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:7205";

/// Persisted client settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay URL (`ws://`, `wss://`, `http://`, `https://` or bare host:port)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl ClientConfig {
    /// `<config dir>/gtunnel/client.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gtunnel").join("client.yaml"))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

/// Everything one tunnel session needs
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub access_token: String,
    pub local_host: String,
    pub local_port: u16,
    /// Empty lets the relay choose
    pub requested_prefix: String,
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Upper bound on one call to the local service
    pub request_timeout: Duration,
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, access_token: impl Into<String>, local_port: u16) -> Self {
        Self {
            server_url: server_url.into(),
            access_token: access_token.into(),
            local_host: "localhost".to_string(),
            local_port,
            requested_prefix: String::new(),
            auth_timeout: AUTH_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            request_timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn tunnel_url(&self) -> String {
        tunnel_url(&self.server_url)
    }

    /// Base URL of the service being exposed
    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local_host, self.local_port)
    }
}

/// Split a relay URL into "uses TLS" and the part after the scheme, without
/// trailing slashes.
pub(crate) fn split_server_url(server_url: &str) -> (bool, &str) {
    let url = server_url.trim().trim_end_matches('/');
    for (scheme, secure) in [("wss://", true), ("https://", true), ("ws://", false), ("http://", false)] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return (secure, rest);
        }
    }
    (false, url)
}

/// WebSocket URL of the relay's tunnel endpoint.
pub fn tunnel_url(server_url: &str) -> String {
    let (secure, rest) = split_server_url(server_url);
    let rest = rest.strip_suffix(WS_PATH).unwrap_or(rest);
    format!("{}://{}{}", if secure { "wss" } else { "ws" }, rest, WS_PATH)
}

/// Public URL under which the tunnel's prefix is reachable.
pub fn public_url(server_url: &str, prefix: &str) -> String {
    let (secure, rest) = split_server_url(server_url);
    let rest = rest.strip_suffix(WS_PATH).unwrap_or(rest);
    format!("{}://{}/{}", if secure { "https" } else { "http" }, rest, prefix)
}
