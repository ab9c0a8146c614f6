#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use gtunnel_relay::{serve, AppState, RelayConfig};
use gtunnel_shared::protocol::{self, AuthRequest, AuthResponse, Envelope, HttpRequest, HttpResponse, Message, WS_PATH};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const TOKEN: &str = "test-token";

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn start_relay() -> (SocketAddr, AppState) {
    start_relay_with(Duration::from_secs(5)).await
}

pub async fn start_relay_with(response_timeout: Duration) -> (SocketAddr, AppState) {
    start_relay_with_config(RelayConfig {
        auth_timeout: Duration::from_millis(500),
        response_timeout,
        ..Default::default()
    })
    .await
}

/// Relay on an ephemeral port using `config` apart from its bind address and token.
pub async fn start_relay_with_config(mut config: RelayConfig) -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.bind = addr;
    config.access_token = TOKEN.to_string();
    let state = AppState::new(config);
    tokio::spawn(serve(listener, state.clone()));
    (addr, state)
}

pub async fn dial(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", addr, WS_PATH))
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut Ws, msg: impl Into<Message>, id: Option<String>) {
    let text = protocol::encode(&msg.into(), id).unwrap();
    ws.send(Frame::Text(text)).await.unwrap();
}

/// Next envelope from the relay, or `None` once the socket closes.
pub async fn recv_envelope(ws: &mut Ws) -> Option<Envelope> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame {
            Ok(Frame::Text(text)) => return Some(Envelope::decode(&text).unwrap()),
            Ok(Frame::Binary(data)) => return Some(Envelope::decode(&data).unwrap()),
            Ok(Frame::Ping(_)) | Ok(Frame::Pong(_)) => continue,
            _ => return None,
        }
    }
}

pub async fn assert_closed(ws: &mut Ws) {
    assert!(recv_envelope(ws).await.is_none(), "expected the relay to close the socket");
}

pub async fn authenticate(addr: SocketAddr, token: &str, prefix: &str) -> (Ws, AuthResponse) {
    let mut ws = dial(addr).await;
    let request = AuthRequest {
        access_token: token.to_string(),
        requested_prefix: prefix.to_string(),
    };
    send(&mut ws, request, None).await;

    let envelope = recv_envelope(&mut ws).await.expect("no auth response");
    let Message::AuthResponse(response) = envelope.message().unwrap() else {
        panic!("expected AuthResponse, got type {}", envelope.tag);
    };
    (ws, response)
}

/// Read the next bridged request, returning its correlation id.
pub async fn recv_request(ws: &mut Ws) -> (Option<String>, HttpRequest) {
    let envelope = recv_envelope(ws).await.expect("tunnel closed");
    let Message::HttpRequest(request) = envelope.message().unwrap() else {
        panic!("expected HttpRequest, got type {}", envelope.tag);
    };
    (envelope.id, request)
}

pub async fn reply(ws: &mut Ws, id: Option<String>, status: u16, body: &str) {
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    let response = HttpResponse {
        status_code: status,
        headers,
        body: body.as_bytes().to_vec(),
    };
    send(ws, response, id).await;
}

/// External GET through the relay, returning status and body.
pub async fn get(url: String) -> (u16, String) {
    let resp = reqwest::get(url).await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.text().await.unwrap())
}

pub async fn wait_for_pending(state: &AppState, count: usize) {
    for _ in 0..50 {
        if state.registry.pending_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {} pending connections", count);
}

pub async fn wait_for_tunnels(state: &AppState, count: usize) {
    for _ in 0..100 {
        if state.registry.tunnel_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("registry never reached {} tunnels", count);
}
