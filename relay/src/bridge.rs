//! HTTP bridge
//!
//! Turns one external HTTP request into one `HttpRequest` frame on the matched
//! tunnel, waits for the correlated `HttpResponse` and replays it to the caller.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tokio::time::timeout_at;
use tracing::{info, warn};

use gtunnel_shared::protocol::{self, HttpRequest, HttpResponse, MessageType};
use gtunnel_shared::Error as ProtocolError;

use crate::headers;
use crate::router;
use crate::server::AppState;

/// Failures of a single bridged request. None of them affect the tunnel itself.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("No tunnel connected")]
    NoTunnel,

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Read error: {0}")]
    BodyRead(String),

    #[error("Message encoding failed")]
    Encode,

    #[error("Tunnel write failed")]
    TunnelWrite,

    #[error("Tunnel closed before replying")]
    TunnelClosed,

    #[error("Tunnel response timeout")]
    Timeout,

    #[error("Unexpected message type {0}")]
    UnexpectedMessage(i64),

    #[error("Invalid tunnel response: {0}")]
    InvalidResponse(String),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::NoTunnel => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeError::BodyRead(_) => StatusCode::BAD_REQUEST,
            BridgeError::Encode => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::TunnelWrite
            | BridgeError::TunnelClosed
            | BridgeError::UnexpectedMessage(_)
            | BridgeError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Fallback handler for every path that is not a relay endpoint.
pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    match bridge(&state, req).await {
        Ok(response) => {
            info!(
                "{} {} -> {} ({} ms)",
                method,
                path,
                response.status().as_u16(),
                start.elapsed().as_millis()
            );
            response
        }
        Err(err) => {
            warn!("{} {} -> {}: {}", method, path, err.status().as_u16(), err);
            err.into_response()
        }
    }
}

/// Forward `req` through its tunnel and build the external response.
pub async fn bridge(state: &AppState, req: Request) -> Result<Response, BridgeError> {
    let (prefix, remaining) = router::route(req.uri().path()).map_err(|_| BridgeError::NoTunnel)?;

    // Clone the tunnel out of the registry; no lock is held while waiting
    let tunnel = state
        .registry
        .lookup_by_prefix(&prefix)
        .await
        .ok_or(BridgeError::NoTunnel)?;

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let path = match req.uri().query() {
        Some(query) => format!("{}?{}", remaining, query),
        None => remaining,
    };
    let method = req.method().to_string();
    let mut forward_headers = headers::request_headers(req.headers());
    headers::inject_forwarded(&mut forward_headers, client_ip, &prefix);

    let declared_len = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > state.config.max_body_size) {
        return Err(BridgeError::BodyTooLarge);
    }
    let body = axum::body::to_bytes(req.into_body(), state.config.max_body_size)
        .await
        .map_err(|e| BridgeError::BodyRead(e.to_string()))?;

    let request = HttpRequest {
        method,
        path,
        headers: forward_headers,
        body: body.to_vec(),
    };

    let (request_id, reply) = tunnel.register();
    let frame = match protocol::encode(&request.into(), Some(request_id.clone())) {
        Ok(frame) => frame,
        Err(e) => {
            tunnel.cancel(&request_id);
            return Err(match e {
                ProtocolError::FrameTooLarge(_) => BridgeError::BodyTooLarge,
                _ => BridgeError::Encode,
            });
        }
    };

    // Queueing and the reply share one deadline; a stalled agent fills the queue
    let deadline = tokio::time::Instant::now() + state.config.response_timeout;
    match timeout_at(deadline, tunnel.send(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            tunnel.cancel(&request_id);
            return Err(BridgeError::TunnelWrite);
        }
        Err(_) => {
            tunnel.cancel(&request_id);
            return Err(BridgeError::Timeout);
        }
    }

    let envelope = match timeout_at(deadline, reply).await {
        Ok(Ok(envelope)) => envelope,
        Ok(Err(_)) => return Err(BridgeError::TunnelClosed),
        Err(_) => {
            tunnel.cancel(&request_id);
            return Err(BridgeError::Timeout);
        }
    };

    if envelope.kind() != Some(MessageType::HttpResponse) {
        return Err(BridgeError::UnexpectedMessage(envelope.tag));
    }
    let reply: HttpResponse = envelope
        .payload()
        .map_err(|e| BridgeError::InvalidResponse(e.to_string()))?;
    let status = StatusCode::from_u16(reply.status_code)
        .map_err(|_| BridgeError::InvalidResponse(format!("status code {}", reply.status_code)))?;

    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers::response_headers(&reply.headers);
    Ok(response)
}
