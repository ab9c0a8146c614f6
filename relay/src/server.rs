//! Relay HTTP surface
//!
//! `/___gTl___/ws` upgrades agents, `/___gTl___/health` reports liveness and
//! every other path goes through the bridge.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gtunnel_shared::protocol::{Envelope, HEALTH_PATH, MAX_MESSAGE_SIZE, WS_PATH};

use crate::bridge;
use crate::config::RelayConfig;
use crate::handshake;
use crate::registry::Registry;
use crate::tunnel::{new_id, Tunnel};

/// Outbound frames buffered per tunnel before the bridge waits
const OUTBOUND_BUFFER: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route(HEALTH_PATH, get(health_handler))
        .fallback(bridge::proxy_handler)
        .with_state(state)
}

/// Serve until the listener fails. Peer addresses are exposed to the bridge
/// for `X-Forwarded-For`.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let id = new_id();
    state.registry.add_pending(&id).await;
    debug!("[{}] Connection upgraded, awaiting authentication", id);

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let auth = handshake::authenticate(
        &mut socket,
        &state.registry,
        &id,
        &state.config.access_token,
        state.config.auth_timeout,
        tx,
    )
    .await;

    let tunnel = match auth {
        Ok(tunnel) => tunnel,
        Err(rejection) => {
            warn!("[{}] Authentication rejected ({}): {}", id, rejection.status(), rejection);
            state.registry.discard_pending(&id).await;
            handshake::notify_rejection(&mut socket, &rejection).await;
            let _ = socket.close().await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_reply(&tunnel, text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => route_reply(&tunnel, &data),
                    Some(Ok(Message::Ping(d))) => {
                        if sender.send(Message::Pong(d)).await.is_err() { break; }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("[{}] Read error: {}", id, e);
                        break;
                    }
                }
            }
            Some(frame) = rx.recv() => {
                if sender.send(Message::Text(frame)).await.is_err() { break; }
            }
        }
    }

    state.registry.remove(&id).await;
    rx.close();
    tunnel.fail_pending();
    let _ = sender.close().await;
    info!("[{}] Tunnel /{} closed", id, tunnel.prefix);
}

/// Hand a frame from the agent to whichever bridged request it answers.
fn route_reply(tunnel: &Tunnel, data: &[u8]) {
    match Envelope::decode(data) {
        Ok(envelope) => {
            let tag = envelope.tag;
            if !tunnel.deliver(envelope) {
                debug!("[{}] Dropped message type {} with no waiter", tunnel.id, tag);
            }
        }
        Err(e) => warn!("[{}] Malformed message from agent: {}", tunnel.id, e),
    }
}
