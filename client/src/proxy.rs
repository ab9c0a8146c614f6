//! Local proxy for forwarding tunnelled requests

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, Method};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use gtunnel_shared::protocol::{HttpRequest, HttpResponse};

/// Headers that describe the hop to the relay rather than the request itself
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// The service being exposed, reached over plain HTTP
#[derive(Clone)]
pub struct LocalService {
    client: Client,
    base_url: String,
}

impl LocalService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProxyError> {
        // Redirects are the caller's business, pass them through untouched
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Replay `request` against the local service and capture its response.
    pub async fn forward(&self, request: HttpRequest) -> Result<HttpResponse, ProxyError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ProxyError::InvalidMethod(request.method.clone()))?;
        let url = self.url_for(&request.path);
        debug!("Proxying {} {}", method, url);

        let response = self
            .client
            .request(method, url)
            .headers(outbound_headers(&request.headers))
            .body(request.body)
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let headers = inbound_headers(response.headers());
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status_code,
            headers,
            body,
        })
    }
}

/// Headers to send to the local service. Entries that are not valid HTTP
/// are dropped instead of failing the whole request.
fn outbound_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if SKIPPED_REQUEST_HEADERS.contains(&lower.as_str()) || lower.starts_with("proxy-") {
            continue;
        }
        match (HeaderName::from_bytes(lower.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!("Skipping invalid header {}", name),
        }
    }
    map
}

/// First value of each response header
fn inbound_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            map.insert(name.as_str().to_string(), value.to_string());
        }
    }
    map
}
