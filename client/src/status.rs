//! Relay health check

use std::time::{Duration, Instant};

use gtunnel_shared::protocol::{HEALTH_PATH, WS_PATH};

use crate::config::split_server_url;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub url: String,
    pub status: u16,
    pub latency: Duration,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == 200
    }
}

/// HTTP URL of the relay's health endpoint.
pub fn health_url(server_url: &str) -> String {
    let (secure, rest) = split_server_url(server_url);
    let rest = rest.strip_suffix(WS_PATH).unwrap_or(rest);
    format!("{}://{}{}", if secure { "https" } else { "http" }, rest, HEALTH_PATH)
}

/// Check the relay health endpoint once.
pub async fn check_health(server_url: &str, timeout: Duration) -> Result<HealthReport, reqwest::Error> {
    let url = health_url(server_url);
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let start = Instant::now();
    let response = client.get(&url).send().await?;

    Ok(HealthReport {
        status: response.status().as_u16(),
        latency: start.elapsed(),
        url,
    })
}
