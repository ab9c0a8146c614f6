//! Agent side of a tunnel
//!
//! [`connect`] dials the relay and authenticates; [`Session::run`] then serves
//! forwarded requests against the local service until the connection drops.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use gtunnel_shared::protocol::{
    self, AuthRequest, AuthResponse, Envelope, HttpRequest, HttpResponse,
    Message as TunnelMessage, MessageType, MAX_MESSAGE_SIZE,
};
use gtunnel_shared::Error as ProtocolError;

use crate::config::AgentConfig;
use crate::proxy::LocalService;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames buffered for the socket writer
const OUTBOUND_BUFFER: usize = 100;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("Timed out waiting for authentication response")]
    AuthTimeout,

    #[error("Authentication failed: {0}")]
    Rejected(String),

    #[error("Unexpected message type {0} during authentication")]
    UnexpectedMessage(i64),

    #[error("Authentication succeeded but no connection id was provided")]
    MissingConnectionId,

    #[error("Invalid message: {0}")]
    Protocol(#[from] gtunnel_shared::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Keepalive failed")]
    KeepaliveFailed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// An authenticated connection to the relay
pub struct Session {
    pub connection_id: String,
    /// Prefix the relay routes to this agent, when it reports one
    pub prefix: Option<String>,
    ws: WsStream,
}

/// Dial the relay and complete the handshake.
pub async fn connect(config: &AgentConfig) -> Result<Session, AgentError> {
    let url = config.tunnel_url();
    info!("Connecting to {}", url);

    let limits = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        max_frame_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };
    let (mut ws, _) = connect_async_with_config(url.as_str(), Some(limits), false)
        .await
        .map_err(|source| AgentError::Connect { url: url.clone(), source })?;

    match authenticate(&mut ws, config).await {
        Ok((connection_id, prefix)) => {
            info!("Authenticated as {}", connection_id);
            Ok(Session {
                connection_id,
                prefix,
                ws,
            })
        }
        Err(e) => {
            let _ = ws.close(None).await;
            Err(e)
        }
    }
}

/// Returns the connection id and, when reported, the assigned prefix.
async fn authenticate(
    ws: &mut WsStream,
    config: &AgentConfig,
) -> Result<(String, Option<String>), AgentError> {
    let request = AuthRequest {
        access_token: config.access_token.clone(),
        requested_prefix: config.requested_prefix.clone(),
    };
    ws.send(Message::Text(protocol::encode(&request.into(), None)?)).await?;
    debug!("Authentication request sent");

    let data = timeout(config.auth_timeout, next_data_frame(ws))
        .await
        .map_err(|_| AgentError::AuthTimeout)??;

    let envelope = Envelope::decode(&data)?;
    if envelope.kind() != Some(MessageType::AuthResponse) {
        return Err(AgentError::UnexpectedMessage(envelope.tag));
    }
    let response: AuthResponse = envelope.payload()?;
    if !response.success {
        let reason = response
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "no reason given".to_string());
        return Err(AgentError::Rejected(reason));
    }
    let connection_id = response
        .connection_id
        .filter(|id| !id.is_empty())
        .ok_or(AgentError::MissingConnectionId)?;
    Ok((connection_id, response.prefix))
}

/// Next text or binary frame, skipping control frames.
async fn next_data_frame(ws: &mut WsStream) -> Result<Vec<u8>, AgentError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) | None => return Err(AgentError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

impl Session {
    /// Serve forwarded requests, one at a time in arrival order, until the
    /// relay goes away or a keepalive ping cannot be written.
    pub async fn run(self, service: LocalService, keepalive_interval: Duration) -> Result<(), AgentError> {
        let id = self.connection_id;
        let (sink, mut stream) = self.ws.split();
        let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

        let mut writer = tokio::spawn(write_loop(sink, rx));
        let mut keepalive = tokio::spawn(keepalive_loop(tx.clone(), keepalive_interval));

        let result = tokio::select! {
            result = read_loop(&id, &mut stream, &tx, &service) => result,
            _ = &mut writer => Err(AgentError::Closed),
            _ = &mut keepalive => Err(AgentError::KeepaliveFailed),
        };

        keepalive.abort();
        writer.abort();
        info!("[{}] Tunnel closed", id);
        result
    }
}

async fn read_loop(
    id: &str,
    stream: &mut SplitStream<WsStream>,
    tx: &mpsc::Sender<Message>,
    service: &LocalService,
) -> Result<(), AgentError> {
    while let Some(frame) = stream.next().await {
        let data = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(data)) => {
                if tx.send(Message::Pong(data)).await.is_err() {
                    return Err(AgentError::Closed);
                }
                continue;
            }
            Ok(Message::Pong(_)) => {
                debug!("[{}] Pong", id);
                continue;
            }
            Ok(Message::Close(_)) => {
                info!("[{}] Relay closed the connection", id);
                return Ok(());
            }
            Ok(Message::Frame(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        let envelope = match Envelope::decode(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[{}] Ignoring malformed message: {}", id, e);
                continue;
            }
        };

        match envelope.message() {
            Ok(TunnelMessage::HttpRequest(request)) => {
                let response = handle_request(id, service, request).await;
                match encode_reply(id, response, envelope.id) {
                    Ok(frame) => {
                        if tx.send(Message::Text(frame)).await.is_err() {
                            return Err(AgentError::Closed);
                        }
                    }
                    Err(e) => warn!("[{}] Failed to encode response: {}", id, e),
                }
            }
            Ok(other) => warn!("[{}] Ignoring unexpected message type {}", id, other.kind().tag()),
            Err(e) => warn!("[{}] Ignoring message type {}: {}", id, envelope.tag, e),
        }
    }

    Ok(())
}

/// Encode `response` as the reply to `request_id`. A response too large for
/// one frame is replaced by a 502 so the relay never sees an oversized frame.
fn encode_reply(
    id: &str,
    response: HttpResponse,
    request_id: Option<String>,
) -> Result<String, ProtocolError> {
    match protocol::encode(&response.into(), request_id.clone()) {
        Err(ProtocolError::FrameTooLarge(size)) => {
            warn!("[{}] Local response too large for the tunnel ({} bytes encoded)", id, size);
            let fallback = HttpResponse::text(502, "gTunnel agent: local response exceeds the tunnel frame limit");
            protocol::encode(&fallback.into(), request_id)
        }
        other => other,
    }
}

/// Call the local service. Failures become a 502 so the external caller
/// always gets an answer.
async fn handle_request(id: &str, service: &LocalService, request: HttpRequest) -> HttpResponse {
    let method = request.method.clone();
    let path = request.path.clone();

    match service.forward(request).await {
        Ok(response) => {
            info!("[{}] {} {} -> {}", id, method, path, response.status_code);
            response
        }
        Err(e) => {
            warn!("[{}] {} {} failed: {}", id, method, path, e);
            HttpResponse::text(502, format!("gTunnel agent could not reach the local service: {}", e))
        }
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!("Write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn keepalive_loop(tx: mpsc::Sender<Message>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        debug!("Sending keepalive ping");
        if tx.send(Message::Ping(b"keepalive".to_vec())).await.is_err() {
            warn!("Keepalive ping could not be queued");
            return;
        }
    }
}
