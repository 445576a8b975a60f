//! Client integration tests.
//!
//! Drives `StreamClient` against a mock WebSocket server to verify delivery,
//! reconnection and teardown end to end.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use streamgate::{
    ConnectionEvent, ConnectionState, Connectivity, Credentials, Entitlement, EventKind,
    KeepaliveConfig, PlanGate, PlanTier, ReconnectConfig, StreamClient, StreamConfig, StreamError,
    StreamHub,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

// ============================================================================
// Test Helpers - Mock Server
// ============================================================================

/// What the client sent in its upgrade request.
#[derive(Debug)]
struct Handshake {
    uri: String,
    cookie: Option<String>,
}

/// A mock streaming backend.
struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    fn config(&self) -> StreamConfig {
        StreamConfig::new(format!("http://{}", self.addr))
            .with_reconnect(ReconnectConfig {
                base_delay_ms: 20,
                max_delay_ms: 1_000,
                ..ReconnectConfig::default()
            })
            .with_keepalive(KeepaliveConfig::disabled())
    }

    /// Accept one socket, recording the upgrade request.
    async fn accept(&self) -> (WebSocketStream<TcpStream>, Handshake) {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .expect("accept failed");

        let mut handshake = None;
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            handshake = Some(Handshake {
                uri: req.uri().to_string(),
                cookie: req
                    .headers()
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned),
            });
            Ok(resp)
        })
        .await
        .expect("websocket handshake");

        (ws, handshake.expect("handshake recorded"))
    }

    /// Assert that no client connects for a while.
    async fn expect_no_connection(&self) {
        assert!(
            timeout(QUIET, self.listener.accept()).await.is_err(),
            "unexpected connection attempt"
        );
    }
}

fn frame(topic: &str, data: Value) -> Message {
    let envelope = json!({
        "type": topic,
        "timestamp": 1_700_000_000_000_i64,
        "data": data,
    });
    Message::Text(envelope.to_string().into())
}

fn metrics(seq: u64) -> Message {
    frame(
        "metrics.update",
        json!({
            "api_id": "123",
            "requests_per_minute": 42.0,
            "error_rate": 0.01,
            "p50_latency_ms": 12.0,
            "p99_latency_ms": 80.0,
            "seq": seq,
        }),
    )
}

/// Subscribe to `metrics.update`, forwarding each `seq` field to a channel.
fn collect_seqs(client: &StreamClient) -> mpsc::UnboundedReceiver<u64> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(EventKind::MetricsUpdate, move |envelope| {
        if let Some(seq) = envelope.data.get("seq").and_then(Value::as_u64) {
            let _ = tx.send(seq);
        }
    });
    rx
}

async fn next_seq(rx: &mut mpsc::UnboundedReceiver<u64>) -> u64 {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscriber channel closed")
}

async fn wait_for_status(client: &StreamClient, want: ConnectionState) {
    let mut status = client.watch_status();
    timeout(WAIT, status.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("status never became {want}"))
        .expect("status channel closed");
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle channel closed")
}

/// Read until the client's close frame arrives.
async fn read_close(ws: &mut WebSocketStream<TcpStream>) -> Option<CloseFrame> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("no close frame") {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => {}
            Some(Err(_)) | None => return None,
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_metrics_frames_delivered_in_order() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/123/overview", Credentials::token("t"));
    let mut seqs = collect_seqs(&client);

    assert_eq!(client.connect(), Ok(Connectivity::Live));

    let (mut ws, handshake) = server.accept().await;
    assert_eq!(handshake.uri, "/ws/apis/123/overview?token=t");
    for seq in 1..=3 {
        ws.send(metrics(seq)).await.unwrap();
    }

    assert_eq!(next_seq(&mut seqs).await, 1);
    assert_eq!(next_seq(&mut seqs).await, 2);
    assert_eq!(next_seq(&mut seqs).await, 3);
    assert!(timeout(QUIET, seqs.recv()).await.is_err(), "extra delivery");
    assert_eq!(client.status(), ConnectionState::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/123/overview", Credentials::token("t"));
    let mut seqs = collect_seqs(&client);
    client.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    ws.send(metrics(1)).await.unwrap();
    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"timestamp": 1}"#.into())).await.unwrap();
    ws.send(metrics(2)).await.unwrap();

    assert_eq!(next_seq(&mut seqs).await, 1);
    assert_eq!(next_seq(&mut seqs).await, 2);
    assert_eq!(client.status(), ConnectionState::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_wildcard_and_exact_subscribers() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/123/overview", Credentials::token("t"));

    let (tx, mut all) = mpsc::unbounded_channel();
    client.subscribe("*", move |envelope| {
        let _ = tx.send(envelope.topic.clone());
    });
    let mut seqs = collect_seqs(&client);
    client.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    ws.send(frame("alert.triggered", json!({"alert_id": "a1", "severity": "critical", "message": "down"})))
        .await
        .unwrap();
    ws.send(metrics(7)).await.unwrap();

    let first = timeout(WAIT, all.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, all.recv()).await.unwrap().unwrap();
    assert_eq!(first, "alert.triggered");
    assert_eq!(second, "metrics.update");
    assert_eq!(next_seq(&mut seqs).await, 7);

    client.disconnect().await;
}

#[tokio::test]
async fn test_send_reaches_server() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/1/logs", Credentials::token("t"));

    assert_eq!(
        client.send(&json!({"action": "pause"})),
        Err(StreamError::NotConnected)
    );

    client.connect().unwrap();
    let (mut ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;

    client.send(&json!({"action": "pause"})).unwrap();
    let received = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let Message::Text(text) = &received else {
        panic!("expected text frame, got {received:?}");
    };
    let value: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value, json!({"action": "pause"}));

    client.disconnect().await;
}

// ============================================================================
// Addressing
// ============================================================================

#[tokio::test]
async fn test_cookie_suppresses_query_token() {
    let server = MockServer::new().await;
    let credentials = Credentials::session_cookie("session=xyz").with_token("abc");
    let client = StreamClient::new(server.config(), "apis/7/requests", credentials);
    client.connect().unwrap();

    let (_ws, handshake) = server.accept().await;
    assert_eq!(handshake.uri, "/ws/apis/7/requests");
    assert_eq!(handshake.cookie.as_deref(), Some("session=xyz"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_missing_credential_opens_nothing() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/7/requests", Credentials::none());

    assert!(matches!(
        client.connect(),
        Err(StreamError::MissingCredential(_))
    ));
    server.expect_no_connection().await;
    assert_eq!(client.status(), ConnectionState::Disconnected);
}

// ============================================================================
// Access gating
// ============================================================================

#[tokio::test]
async fn test_access_denied_never_opens_socket() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/123/overview", Credentials::token("t"))
        .with_access(&PlanGate::default(), &Entitlement::for_plan(PlanTier::Free));
    let mut status = client.watch_status();

    assert_eq!(client.connect(), Ok(Connectivity::Polling));
    server.expect_no_connection().await;

    assert_eq!(client.status(), ConnectionState::Disconnected);
    assert!(!status.has_changed().unwrap());
    assert!(client.failure().is_none());
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_subscriptions_survive_reconnect() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/apis/123/overview", Credentials::token("t"));
    let mut seqs = collect_seqs(&client);
    let mut events = client.lifecycle();
    client.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    ws.send(metrics(1)).await.unwrap();
    assert_eq!(next_seq(&mut seqs).await, 1);

    // A server-initiated close is not a clean closure, even with 1000.
    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "server restart".into(),
    }))
    .await
    .unwrap();
    drop(ws);

    let (mut ws, _) = server.accept().await;
    ws.send(metrics(2)).await.unwrap();
    assert_eq!(next_seq(&mut seqs).await, 2);
    assert_eq!(client.subscription_count(), 1);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected {
            code: 1000,
            reason: "server restart".to_string(),
        }
    );
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnecting { attempt: 1, .. }
    ));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_retry_counter_resets_after_successful_open() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/x", Credentials::token("t"));
    let mut events = client.lifecycle();
    client.connect().unwrap();

    for _ in 0..3 {
        let (ws, _) = server.accept().await;
        wait_for_status(&client, ConnectionState::Connected).await;
        drop(ws);
    }
    let (_ws, _) = server.accept().await;

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        if let ConnectionEvent::Reconnecting { attempt, delay } = next_event(&mut events).await {
            assert_eq!(delay, Duration::from_millis(20));
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![1, 1, 1]);

    client.disconnect().await;
}

#[tokio::test]
async fn test_retries_exhausted_sets_error() {
    // Nothing listens on this port, so every open fails abnormally.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = StreamConfig::new(format!("http://{addr}")).with_reconnect(ReconnectConfig {
        enabled: true,
        base_delay_ms: 10,
        max_delay_ms: 1_000,
        max_retries: 5,
        jitter_ms: 0,
    });
    let client = StreamClient::new(config, "/apis/123/overview", Credentials::token("t"));
    let mut events = client.lifecycle();
    client.connect().unwrap();

    let mut closures = 0;
    let mut delays = Vec::new();
    let failed = loop {
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { code, .. } => {
                assert_eq!(code, 1006);
                closures += 1;
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay);
            }
            ConnectionEvent::ReconnectFailed { attempts, .. } => break attempts,
            ConnectionEvent::Connected => panic!("nothing should accept"),
        }
    };

    assert_eq!(closures, 6);
    assert_eq!(failed, 5);
    assert_eq!(
        delays,
        [10, 20, 40, 80, 160].map(Duration::from_millis).to_vec()
    );
    assert_eq!(client.status(), ConnectionState::Error);
    assert!(matches!(
        client.failure(),
        Some(StreamError::MaxRetriesExceeded { attempts: 5, .. })
    ));
}

#[tokio::test]
async fn test_disabled_policy_fails_on_first_closure() {
    let server = MockServer::new().await;
    let config = server.config().with_reconnect(ReconnectConfig {
        enabled: false,
        ..ReconnectConfig::default()
    });
    let client = StreamClient::new(config, "/x", Credentials::token("t"));
    client.connect().unwrap();

    let (ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;
    drop(ws);

    wait_for_status(&client, ConnectionState::Error).await;
    server.expect_no_connection().await;
}

#[tokio::test]
async fn test_reconnect_after_error() {
    let server = MockServer::new().await;
    let config = server.config().with_reconnect(ReconnectConfig {
        enabled: false,
        ..ReconnectConfig::default()
    });
    let client = StreamClient::new(config, "/x", Credentials::token("t"));
    client.connect().unwrap();

    let (ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;
    drop(ws);
    wait_for_status(&client, ConnectionState::Error).await;

    // A fresh connect starts over from the error state.
    client.connect().unwrap();
    let (_ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;
    assert!(client.failure().is_none());

    client.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_right_after_error_starts_new_attempt() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = StreamConfig::new(format!("http://{addr}")).with_reconnect(ReconnectConfig {
        enabled: false,
        ..ReconnectConfig::default()
    });
    let client = StreamClient::new(config, "/x", Credentials::token("t"));
    let mut events = client.lifecycle();

    for _ in 0..50 {
        client.connect().unwrap();
        wait_for_status(&client, ConnectionState::Error).await;
        loop {
            if let ConnectionEvent::ReconnectFailed { .. } = next_event(&mut events).await {
                break;
            }
        }
        // The failed task may not have exited yet; connect must still start over.
        assert_eq!(client.connect(), Ok(Connectivity::Live));
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::ReconnectFailed { .. } => break,
                ConnectionEvent::Connected => panic!("nothing should accept"),
                _ => {}
            }
        }
    }
    client.disconnect().await;
}

#[tokio::test]
async fn test_keepalive_timeout_triggers_reconnect() {
    let server = MockServer::new().await;
    let config = server.config().with_keepalive(KeepaliveConfig {
        interval_secs: 1,
        max_missed_pongs: 1,
    });
    let client = StreamClient::new(config, "/x", Credentials::token("t"));
    let mut events = client.lifecycle();
    client.connect().unwrap();

    // Never read from the socket, so pings go unanswered.
    let (_silent, _) = server.accept().await;

    let reason = loop {
        if let ConnectionEvent::Disconnected { code, reason } = next_event(&mut events).await {
            assert_eq!(code, 1006);
            break reason;
        }
    };
    assert_eq!(reason, "keepalive timeout");

    let (_ws, _) = server.accept().await;
    client.disconnect().await;
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_clean_disconnect_does_not_reconnect() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/x", Credentials::token("t"));
    let mut events = client.lifecycle();
    client.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;

    let disconnect = client.disconnect();
    assert_eq!(client.status(), ConnectionState::Disconnected);

    let (close, ()) = tokio::join!(read_close(&mut ws), disconnect);
    let close = close.expect("close frame with a status");
    assert_eq!(close.code, CloseCode::Normal);
    assert_eq!(close.reason.as_str(), "client disconnect");

    server.expect_no_connection().await;
    assert_eq!(client.status(), ConnectionState::Disconnected);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, ConnectionEvent::Reconnecting { .. })),
        "reconnect scheduled after clean close: {seen:?}"
    );
}

#[tokio::test]
async fn test_drop_closes_socket() {
    let server = MockServer::new().await;
    let client = StreamClient::new(server.config(), "/x", Credentials::token("t"));
    client.connect().unwrap();

    let (mut ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;
    drop(client);

    let close = read_close(&mut ws).await;
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Normal));
    server.expect_no_connection().await;
}

#[tokio::test]
async fn test_hub_drop_closes_sockets_of_held_clients() {
    let server = MockServer::new().await;
    let hub = StreamHub::new(server.config(), Credentials::token("t"));
    let client = hub.connect("/x").unwrap();

    let (mut ws, _) = server.accept().await;
    wait_for_status(&client, ConnectionState::Connected).await;
    drop(hub);

    assert_eq!(client.status(), ConnectionState::Disconnected);
    let close = read_close(&mut ws).await;
    assert_eq!(close.map(|f| f.code), Some(CloseCode::Normal));
    server.expect_no_connection().await;
}
