//! Relay configuration
//!
//! Values come from defaults, then an optional `server.yaml`, then the
//! environment. The binary applies command-line flags last.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gtunnel_shared::protocol::{AUTH_TIMEOUT, RESPONSE_TIMEOUT};

pub const DEFAULT_PORT: u16 = 7205;

/// Largest external request body the bridge will buffer (10 MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Runtime settings for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Token agents must present. Empty accepts agents that send an empty token.
    pub access_token: String,
    pub auth_timeout: Duration,
    pub response_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            access_token: String::new(),
            auth_timeout: AUTH_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// On-disk shape of `server.yaml`. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub access_token: Option<String>,
    pub port: Option<u16>,
    pub host: Option<IpAddr>,
    pub auth_timeout_secs: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub max_body_size: Option<usize>,
}

impl RelayConfig {
    /// Load from `path` if given, otherwise from the default location when it
    /// exists, then overlay the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let file = match path {
            Some(p) => Some(read_file(p)?),
            None => match Self::default_path() {
                Some(p) if p.exists() => Some(read_file(&p)?),
                _ => None,
            },
        };
        if let Some(file) = file {
            config.apply_file(file);
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// `<config dir>/gtunnel/server.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gtunnel").join("server.yaml"))
    }

    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(token) = file.access_token {
            self.access_token = token;
        }
        if let Some(host) = file.host {
            self.bind.set_ip(host);
        }
        if let Some(port) = file.port {
            self.bind.set_port(port);
        }
        if let Some(secs) = file.auth_timeout_secs {
            self.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.response_timeout_secs {
            self.response_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = file.max_body_size {
            self.max_body_size = size;
        }
    }

    /// `GTUNNEL_ACCESS_TOKEN`, then `GTUNNEL_PORT` or `PORT`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("GTUNNEL_ACCESS_TOKEN") {
            self.access_token = token;
        }
        for key in ["GTUNNEL_PORT", "PORT"] {
            if let Some(raw) = lookup(key) {
                let port: u16 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid {}: {:?}", key, raw))?;
                self.bind.set_port(port);
                break;
            }
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
