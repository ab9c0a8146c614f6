mod common;

use common::*;
use futures_util::SinkExt;
use gtunnel_relay::RelayConfig;
use gtunnel_shared::protocol::{AuthRequest, AuthResponse, HEALTH_PATH};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as Frame;

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (addr, _state) = start_relay().await;
    let (status, body) = get(format!("http://{}{}", addr, HEALTH_PATH)).await;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["status"], "ok");
}

#[tokio::test]
async fn handshake_succeeds_with_valid_token() {
    let (addr, state) = start_relay().await;
    let (_ws, response) = authenticate(addr, TOKEN, "app-1").await;

    assert!(response.success);
    let id = response.connection_id.expect("connection id");
    assert!(!id.is_empty());
    assert_eq!(response.prefix.as_deref(), Some("app-1"));

    let tunnel = state.registry.lookup_by_prefix("app-1").await.unwrap();
    assert_eq!(tunnel.id, id);
    assert_eq!(state.registry.get(&id).await.unwrap().prefix, "app-1");
    assert_eq!(state.registry.pending_count().await, 0);
}

#[tokio::test]
async fn handshake_derives_prefix_when_empty() {
    let (addr, state) = start_relay().await;
    let (_ws, response) = authenticate(addr, TOKEN, "").await;

    assert!(response.success);
    let prefix = response.prefix.unwrap();
    assert!(prefix.starts_with("app-"));
    assert!(state.registry.lookup_by_prefix(&prefix).await.is_some());
}

#[tokio::test]
async fn handshake_rejects_bad_token() {
    let (addr, state) = start_relay().await;
    let (mut ws, response) = authenticate(addr, "wrong", "app-1").await;

    assert!(!response.success);
    assert!(response.connection_id.is_none());
    assert_closed(&mut ws).await;
    assert_eq!(state.registry.tunnel_count().await, 0);
    assert_eq!(state.registry.pending_count().await, 0);

    // The prefix was not left reserved
    let (_ws, response) = authenticate(addr, TOKEN, "app-1").await;
    assert!(response.success);
}

#[tokio::test]
async fn handshake_rejects_claimed_prefix() {
    let (addr, _state) = start_relay().await;
    let (mut first, response) = authenticate(addr, TOKEN, "app-1").await;
    assert!(response.success);

    let (mut second, response) = authenticate(addr, TOKEN, "app-1").await;
    assert!(!response.success);
    assert!(response.message.unwrap().contains("already in use"));
    assert_closed(&mut second).await;

    // First tunnel is unaffected
    let request = tokio::spawn(get(format!("http://{}/app-1/ping", addr)));
    let (id, forwarded) = recv_request(&mut first).await;
    assert_eq!(forwarded.path, "/ping");
    reply(&mut first, id, 200, "pong").await;
    assert_eq!(request.await.unwrap(), (200, "pong".to_string()));
}

#[tokio::test]
async fn concurrent_handshakes_for_same_prefix_have_one_winner() {
    let (addr, state) = start_relay().await;

    let a = tokio::spawn(authenticate(addr, TOKEN, "dup"));
    let b = tokio::spawn(authenticate(addr, TOKEN, "dup"));
    let (_ws_a, ra) = a.await.unwrap();
    let (_ws_b, rb) = b.await.unwrap();

    assert!(ra.success ^ rb.success);
    assert_eq!(state.registry.tunnel_count().await, 1);
}

#[tokio::test]
async fn first_message_must_be_auth_request() {
    let (addr, state) = start_relay().await;
    let mut ws = dial(addr).await;
    reply(&mut ws, None, 200, "not an auth request").await;

    let envelope = recv_envelope(&mut ws).await.unwrap();
    let response: AuthResponse = envelope.payload().unwrap();
    assert!(!response.success);
    assert_closed(&mut ws).await;
    assert_eq!(state.registry.pending_count().await, 0);
}

#[tokio::test]
async fn silent_connection_times_out() {
    let (addr, state) = start_relay().await;
    let mut ws = dial(addr).await;

    // No AuthResponse is sent on timeout, the socket just closes
    assert_closed(&mut ws).await;
    assert_eq!(state.registry.pending_count().await, 0);
    assert_eq!(state.registry.tunnel_count().await, 0);
}

#[tokio::test]
async fn control_frames_do_not_count_as_auth() {
    let (addr, _state) = start_relay().await;
    let mut ws = dial(addr).await;
    ws.send(Frame::Ping(b"hi".to_vec())).await.unwrap();
    let request = AuthRequest {
        access_token: TOKEN.into(),
        requested_prefix: "app-1".into(),
    };
    send(&mut ws, request, None).await;

    let envelope = recv_envelope(&mut ws).await.unwrap();
    let response: AuthResponse = envelope.payload().unwrap();
    assert!(response.success);
}

#[tokio::test]
async fn unknown_prefix_is_service_unavailable() {
    let (addr, _state) = start_relay().await;
    let (_ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let (status, _) = get(format!("http://{}/app-2/x", addr)).await;
    assert_eq!(status, 503);

    let (status, _) = get(format!("http://{}/", addr)).await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn request_is_bridged_with_prefix_stripped() {
    let (addr, _state) = start_relay().await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let client = reqwest::Client::new();
    let url = format!("http://{}/app-1/items/7?verbose=1", addr);
    let request = tokio::spawn(async move {
        let resp = client
            .post(url)
            .header("x-custom", "one")
            .body("payload")
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
        (status, content_type, resp.text().await.unwrap())
    });

    let (id, forwarded) = recv_request(&mut ws).await;
    assert!(id.is_some());
    assert_eq!(forwarded.method, "POST");
    assert_eq!(forwarded.path, "/items/7?verbose=1");
    assert_eq!(forwarded.body, b"payload");
    assert_eq!(forwarded.headers["x-custom"], "one");
    assert_eq!(forwarded.headers["x-forwarded-prefix"], "/app-1");
    assert_eq!(forwarded.headers["x-forwarded-for"], "127.0.0.1");

    reply(&mut ws, id, 201, "created").await;
    let (status, content_type, body) = request.await.unwrap();
    assert_eq!(status, 201);
    assert_eq!(content_type, "text/plain");
    assert_eq!(body, "created");
}

#[tokio::test]
async fn silent_agent_times_out_and_tunnel_survives() {
    let (addr, _state) = start_relay_with(Duration::from_millis(300)).await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let first = tokio::spawn(get(format!("http://{}/app-1/slow", addr)));
    let (late_id, _) = recv_request(&mut ws).await;
    let (status, _) = first.await.unwrap();
    assert_eq!(status, 504);

    // A reply to the abandoned request is discarded
    reply(&mut ws, late_id, 200, "late").await;

    let second = tokio::spawn(get(format!("http://{}/app-1/fast", addr)));
    let (id, forwarded) = recv_request(&mut ws).await;
    assert_eq!(forwarded.path, "/fast");
    reply(&mut ws, id, 200, "fresh").await;
    assert_eq!(second.await.unwrap(), (200, "fresh".to_string()));
}

#[tokio::test]
async fn concurrent_requests_are_matched_by_id() {
    let (addr, _state) = start_relay().await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let a = tokio::spawn(get(format!("http://{}/app-1/a", addr)));
    let (id_a, req_a) = recv_request(&mut ws).await;
    let b = tokio::spawn(get(format!("http://{}/app-1/b", addr)));
    let (id_b, req_b) = recv_request(&mut ws).await;

    // Answer out of order
    reply(&mut ws, id_b, 200, &req_b.path).await;
    reply(&mut ws, id_a, 200, &req_a.path).await;

    assert_eq!(a.await.unwrap(), (200, "/a".to_string()));
    assert_eq!(b.await.unwrap(), (200, "/b".to_string()));
}

#[tokio::test]
async fn uncorrelated_reply_answers_single_request() {
    let (addr, _state) = start_relay().await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let request = tokio::spawn(get(format!("http://{}/app-1/", addr)));
    let _ = recv_request(&mut ws).await;
    reply(&mut ws, None, 200, "legacy").await;
    assert_eq!(request.await.unwrap(), (200, "legacy".to_string()));
}

#[tokio::test]
async fn wrong_reply_type_is_bad_gateway() {
    let (addr, _state) = start_relay().await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let request = tokio::spawn(get(format!("http://{}/app-1/x", addr)));
    let (id, _) = recv_request(&mut ws).await;
    let bogus = AuthRequest {
        access_token: String::new(),
        requested_prefix: String::new(),
    };
    send(&mut ws, bogus, id).await;

    let (status, _) = request.await.unwrap();
    assert_eq!(status, 502);
}

#[tokio::test]
async fn agent_disconnect_fails_in_flight_and_unroutes() {
    let (addr, state) = start_relay().await;
    let (mut ws, _) = authenticate(addr, TOKEN, "app-1").await;

    let request = tokio::spawn(get(format!("http://{}/app-1/x", addr)));
    let _ = recv_request(&mut ws).await;
    ws.close(None).await.unwrap();
    drop(ws);

    let (status, _) = request.await.unwrap();
    assert_eq!(status, 502);

    wait_for_tunnels(&state, 0).await;
    let (status, _) = get(format!("http://{}/app-1/x", addr)).await;
    assert_eq!(status, 503);

    // The prefix can be claimed again
    let (_ws, response) = authenticate(addr, TOKEN, "app-1").await;
    assert!(response.success);
}

#[tokio::test]
async fn connection_dropped_during_auth_is_discarded() {
    let (addr, state) = start_relay_with_config(RelayConfig {
        auth_timeout: Duration::from_secs(10),
        ..Default::default()
    })
    .await;

    let mut ws = dial(addr).await;
    ws.send(Frame::Ping(b"hi".to_vec())).await.unwrap();
    drop(ws);

    // Well before the auth timeout
    wait_for_pending(&state, 0).await;
    assert_eq!(state.registry.tunnel_count().await, 0);
}

fn small_body_relay() -> RelayConfig {
    RelayConfig {
        max_body_size: 1024,
        ..Default::default()
    }
}

#[tokio::test]
async fn declared_body_over_limit_is_payload_too_large() {
    let (addr, state) = start_relay_with_config(small_body_relay()).await;
    let (_ws, response) = authenticate(addr, TOKEN, "lim").await;
    assert!(response.success);

    let resp = reqwest::Client::new()
        .post(format!("http://{}/lim/upload", addr))
        .body(vec![b'x'; 2048])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    assert_eq!(state.registry.tunnel_count().await, 1);
}

#[tokio::test]
async fn streamed_body_over_limit_is_bad_request() {
    let (addr, state) = start_relay_with_config(small_body_relay()).await;
    let (_ws, response) = authenticate(addr, TOKEN, "lim").await;
    assert!(response.success);

    // Chunked, so no Content-Length to check up front
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let chunk = "x".repeat(2048);
    let request = format!(
        "POST /lim/upload HTTP/1.1\r\nHost: {}\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        addr,
        chunk.len(),
        chunk
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(2).any(|w| w == b"\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed without a response");
        head.extend_from_slice(&buf[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 400"), "{}", String::from_utf8_lossy(&head));
    assert_eq!(state.registry.tunnel_count().await, 1);
}

#[tokio::test]
async fn body_too_large_for_one_frame_keeps_tunnel() {
    let (addr, state) = start_relay_with_config(RelayConfig {
        max_body_size: 32 * 1024 * 1024,
        ..Default::default()
    })
    .await;
    let (mut ws, response) = authenticate(addr, TOKEN, "big").await;
    assert!(response.success);

    let resp = reqwest::Client::new()
        .post(format!("http://{}/big/upload", addr))
        .body(vec![0xffu8; 13 * 1024 * 1024])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    assert_eq!(state.registry.tunnel_count().await, 1);

    // The next request still reaches the agent
    let call = tokio::spawn(get(format!("http://{}/big/ping", addr)));
    let (id, request) = recv_request(&mut ws).await;
    assert_eq!(request.path, "/ping");
    reply(&mut ws, id, 200, "pong").await;
    assert_eq!(call.await.unwrap(), (200, "pong".to_string()));
}
