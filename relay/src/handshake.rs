//! Agent authentication
//!
//! A freshly upgraded socket must send one `AuthRequest` within the auth
//! timeout. The requested prefix is reserved first, then the token checked,
//! and only then is the connection promoted from pending to a routable tunnel.

use axum::extract::ws::{Message, WebSocket};
use axum::http::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use gtunnel_shared::protocol::{self, AuthRequest, AuthResponse, Envelope, MessageType, CONTROL_SEGMENT};

use crate::registry::Registry;
use crate::tunnel::{derive_prefix, Tunnel};

/// Why a connection was refused.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("no authentication request within the timeout")]
    Timeout,

    #[error("connection closed during authentication")]
    Closed,

    #[error("read failed during authentication: {0}")]
    ReadFailed(String),

    #[error("malformed authentication request: {0}")]
    Malformed(String),

    #[error("expected an authentication request, got message type {0}")]
    UnexpectedMessage(i64),

    #[error("invalid prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("base URL already in use: {0}")]
    PrefixConflict(String),

    #[error("invalid access token")]
    InvalidToken,

    #[error("connection is no longer pending")]
    NotPending,
}

impl Rejection {
    /// HTTP status with the same meaning, for logs.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Timeout => StatusCode::REQUEST_TIMEOUT,
            Rejection::PrefixConflict(_) => StatusCode::CONFLICT,
            Rejection::InvalidToken => StatusCode::UNAUTHORIZED,
            Rejection::NotPending => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the agent is still listening and should get an `AuthResponse`.
    pub fn notifies_agent(&self) -> bool {
        !matches!(self, Rejection::Timeout | Rejection::Closed | Rejection::ReadFailed(_))
    }
}

/// Strip the leading slash and fall back to a prefix derived from `id`.
pub fn resolve_prefix(requested: &str, id: &str) -> Result<String, Rejection> {
    let prefix = requested.strip_prefix('/').unwrap_or(requested);
    let prefix = prefix.strip_suffix('/').unwrap_or(prefix);

    if prefix.is_empty() {
        return Ok(derive_prefix(id));
    }
    if prefix.contains('/') || prefix == CONTROL_SEGMENT {
        return Err(Rejection::InvalidPrefix(requested.to_string()));
    }
    Ok(prefix.to_string())
}

/// Decide on an `AuthRequest` and, if it passes, promote connection `id`.
pub async fn authorize(
    registry: &Registry,
    id: &str,
    expected_token: &str,
    request: &AuthRequest,
    tx: mpsc::Sender<String>,
) -> Result<Tunnel, Rejection> {
    let prefix = resolve_prefix(&request.requested_prefix, id)?;

    if !registry.reserve(&prefix, id).await {
        return Err(Rejection::PrefixConflict(prefix));
    }

    if request.access_token != expected_token {
        registry.release(&prefix, id).await;
        return Err(Rejection::InvalidToken);
    }

    match registry.insert(id, &prefix, tx).await {
        Some(tunnel) => Ok(tunnel),
        None => {
            registry.release(&prefix, id).await;
            Err(Rejection::NotPending)
        }
    }
}

/// Wait for the first data frame and decode it as an `AuthRequest`.
pub async fn read_auth_request(socket: &mut WebSocket, limit: Duration) -> Result<AuthRequest, Rejection> {
    let frame = timeout(limit, next_data_frame(socket))
        .await
        .map_err(|_| Rejection::Timeout)??;

    let envelope = Envelope::decode(&frame).map_err(|e| Rejection::Malformed(e.to_string()))?;
    match envelope.kind() {
        Some(MessageType::AuthRequest) => envelope
            .payload::<AuthRequest>()
            .map_err(|e| Rejection::Malformed(e.to_string())),
        _ => Err(Rejection::UnexpectedMessage(envelope.tag)),
    }
}

async fn next_data_frame(socket: &mut WebSocket) -> Result<Vec<u8>, Rejection> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Ping(data))) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    return Err(Rejection::Closed);
                }
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Err(Rejection::Closed),
            Some(Err(e)) => return Err(Rejection::ReadFailed(e.to_string())),
        }
    }
}

/// Run the whole handshake on `socket` for pending connection `id`.
///
/// On success the agent has been told its connection id and prefix. On
/// failure nothing has been sent; the caller decides whether to notify.
pub async fn authenticate(
    socket: &mut WebSocket,
    registry: &Registry,
    id: &str,
    expected_token: &str,
    limit: Duration,
    tx: mpsc::Sender<String>,
) -> Result<Tunnel, Rejection> {
    let request = read_auth_request(socket, limit).await?;
    debug!("[{}] Auth request for prefix {:?}", id, request.requested_prefix);

    let tunnel = authorize(registry, id, expected_token, &request, tx).await?;

    let reply = protocol::encode(&AuthResponse::accepted(id, &tunnel.prefix).into(), None)
        .map_err(|e| Rejection::Malformed(e.to_string()))?;
    if socket.send(Message::Text(reply)).await.is_err() {
        registry.remove(id).await;
        return Err(Rejection::Closed);
    }

    info!("[{}] Authentication successful, routing /{}", id, tunnel.prefix);
    Ok(tunnel)
}

/// Best-effort `AuthResponse{success: false}` before the socket is dropped.
pub async fn notify_rejection(socket: &mut WebSocket, rejection: &Rejection) {
    if !rejection.notifies_agent() {
        return;
    }
    if let Ok(reply) = protocol::encode(&AuthResponse::rejected(rejection.to_string()).into(), None) {
        let _ = socket.send(Message::Text(reply)).await;
    }
}
