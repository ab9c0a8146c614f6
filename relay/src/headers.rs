//! Header handling for bridged requests
//!
//! Tunnel messages carry one value per header name, so only the first value
//! of a repeated header survives the trip. Hop-by-hop headers are stripped in
//! both directions and standard proxy headers are added on the way in.

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::IpAddr;

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// First value of every forwardable header. Values that are not valid UTF-8 are skipped.
pub fn request_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

/// Add `X-Forwarded-*` headers describing the external request.
pub fn inject_forwarded(headers: &mut HashMap<String, String>, client_ip: Option<IpAddr>, prefix: &str) {
    if let Some(ip) = client_ip {
        let chain = match headers.get("x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        headers.insert("x-forwarded-for".into(), chain);
    }
    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = headers.get("host").cloned() {
            headers.insert("x-forwarded-host".into(), host);
        }
    }
    headers
        .entry("x-forwarded-proto".into())
        .or_insert_with(|| "http".into());
    headers.insert("x-forwarded-prefix".into(), format!("/{}", prefix));
}

/// Build the external response headers from a tunnel reply.
///
/// `content-length` is dropped because the relay sets it from the buffered body.
pub fn response_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            out.insert(hn, hv);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_only() {
        let mut h = HeaderMap::new();
        h.append("accept", HeaderValue::from_static("text/html"));
        h.append("accept", HeaderValue::from_static("application/json"));
        h.insert("connection", HeaderValue::from_static("keep-alive"));
        h.insert("x-token", HeaderValue::from_bytes(b"\xff\xfe").unwrap());

        let out = request_headers(&h);
        assert_eq!(out.get("accept").map(String::as_str), Some("text/html"));
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("x-token"));
    }

    #[test]
    fn test_proxy_headers() {
        let mut h: HashMap<String, String> = [("host".to_string(), "tunnel.example.com".to_string())].into();
        inject_forwarded(&mut h, Some("1.2.3.4".parse().unwrap()), "app-1");

        assert_eq!(h["x-forwarded-for"], "1.2.3.4");
        assert_eq!(h["x-forwarded-host"], "tunnel.example.com");
        assert_eq!(h["x-forwarded-proto"], "http");
        assert_eq!(h["x-forwarded-prefix"], "/app-1");
    }

    #[test]
    fn test_proxy_headers_extend_front_proxy() {
        let mut h: HashMap<String, String> = [
            ("x-forwarded-for".to_string(), "9.9.9.9".to_string()),
            ("x-forwarded-proto".to_string(), "https".to_string()),
        ]
        .into();
        inject_forwarded(&mut h, Some("10.0.0.2".parse().unwrap()), "app-1");

        assert_eq!(h["x-forwarded-for"], "9.9.9.9, 10.0.0.2");
        assert_eq!(h["x-forwarded-proto"], "https");
    }

    #[test]
    fn test_response_headers() {
        let h: HashMap<String, String> = [
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Content-Length".to_string(), "999".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("bad header".to_string(), "x".to_string()),
        ]
        .into();
        let out = response_headers(&h);

        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert!(out.get("content-length").is_none());
        assert!(out.get("transfer-encoding").is_none());
        assert_eq!(out.len(), 1);
    }
}
