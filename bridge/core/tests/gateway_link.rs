//! Gateway link against an in-process fake gateway

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{
    Bridge, BridgeConfig, BridgeMessage, ConnectionId, FrameHandler, GatewayLink, InboundFrame,
    LinkConfig, LinkState, SessionHandle,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type GatewaySocket = WebSocketStream<TcpStream>;

const STEP: Duration = Duration::from_secs(5);

async fn fake_gateway() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> GatewaySocket {
    let (stream, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut GatewaySocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut GatewaySocket) -> Value {
    loop {
        match timeout(STEP, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => {}
            other => panic!("gateway socket ended: {other:?}"),
        }
    }
}

/// Run the challenge/connect/hello exchange, returning the connect request
async fn handshake(ws: &mut GatewaySocket, nonce: &str) -> Value {
    send_json(
        ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": nonce}}),
    )
    .await;
    let connect = next_json(ws).await;
    send_json(
        ws,
        json!({"type": "res", "id": connect["id"], "ok": true, "payload": {"type": "hello-ok", "protocol": 3}}),
    )
    .await;
    connect
}

fn link_config(url: String) -> LinkConfig {
    LinkConfig {
        url,
        token: Some("gw-token".to_string()),
        reconnect_base: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..LinkConfig::default()
    }
}

async fn wait_for_state(link: &GatewayLink, wanted: LinkState) {
    let mut state = link.subscribe_state();
    timeout(STEP, state.wait_for(|s| *s == wanted))
        .await
        .unwrap()
        .unwrap();
}

#[derive(Default)]
struct Collector {
    frames: Mutex<Vec<InboundFrame>>,
}

impl FrameHandler for Collector {
    fn handle_frame(&self, frame: InboundFrame) {
        self.frames.lock().push(frame);
    }
}

#[tokio::test]
async fn test_handshake_reaches_connected() {
    let (listener, url) = fake_gateway().await;
    let link = GatewayLink::new(link_config(url));
    link.connect();

    let mut ws = accept(&listener).await;
    let connect = handshake(&mut ws, "nonce-abc").await;

    assert_eq!(connect["type"], json!("req"));
    assert_eq!(connect["method"], json!("connect"));
    assert_eq!(connect["params"]["nonce"], json!("nonce-abc"));
    assert_eq!(connect["params"]["role"], json!("operator"));
    assert_eq!(connect["params"]["auth"]["token"], json!("gw-token"));
    assert_eq!(connect["params"]["minProtocol"], json!(3));

    wait_for_state(&link, LinkState::Connected).await;
    assert!(link.is_connected());
    link.shutdown();
}

#[tokio::test]
async fn test_frames_after_handshake_reach_handler() {
    let (listener, url) = fake_gateway().await;
    let link = GatewayLink::new(link_config(url));
    let collector = Arc::new(Collector::default());
    link.on_frame(collector.clone());
    link.connect();

    let mut ws = accept(&listener).await;
    handshake(&mut ws, "n").await;
    wait_for_state(&link, LinkState::Connected).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    send_json(
        &mut ws,
        json!({"type": "event", "event": "notification", "payload": {"text": "ping"}}),
    )
    .await;

    timeout(STEP, async {
        while collector.frames.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(collector.frames.lock().len(), 1);
    assert_eq!(link.metrics().frames_dropped, 1);
    link.shutdown();
}

#[tokio::test]
async fn test_rejected_handshake_closes_and_retries() {
    let (listener, url) = fake_gateway().await;
    let link = GatewayLink::new(link_config(url));
    link.connect();

    let mut ws = accept(&listener).await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "n1"}}),
    )
    .await;
    let connect = next_json(&mut ws).await;
    send_json(
        &mut ws,
        json!({"type": "res", "id": connect["id"], "ok": false, "error": {"code": "AUTH", "message": "bad token"}}),
    )
    .await;

    // The link drops the socket and comes back for another attempt
    let mut retry = accept(&listener).await;
    handshake(&mut retry, "n2").await;
    wait_for_state(&link, LinkState::Connected).await;
    link.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_gateway_drops() {
    let (listener, url) = fake_gateway().await;
    let link = GatewayLink::new(link_config(url));
    link.connect();

    let mut first = accept(&listener).await;
    handshake(&mut first, "n1").await;
    wait_for_state(&link, LinkState::Connected).await;

    first.close(None).await.unwrap();
    drop(first);

    let mut second = accept(&listener).await;
    let connect = handshake(&mut second, "n2").await;
    assert_eq!(connect["params"]["nonce"], json!("n2"));
    wait_for_state(&link, LinkState::Connected).await;
    assert!(link.metrics().reconnects_scheduled >= 1);
    link.shutdown();
}

#[tokio::test]
async fn test_bridge_round_trip_over_websocket() {
    let (listener, url) = fake_gateway().await;
    let mut config = BridgeConfig::default();
    config.gateway.url = url;
    config.delivery.push_enabled = false;
    let bridge = Bridge::new(&config).unwrap();
    bridge.start();

    let mut ws = accept(&listener).await;
    handshake(&mut ws, "n").await;
    timeout(STEP, async {
        while !bridge.is_gateway_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    bridge.register_session(&"phone".into(), SessionHandle::new(ConnectionId::new(), tx));
    assert!(matches!(
        rx.recv().await,
        Some(BridgeMessage::Registered { .. })
    ));

    let task_id = bridge
        .submit_task(&"phone".into(), "127.0.0.1", "turn on the lights")
        .unwrap();

    let request = next_json(&mut ws).await;
    assert_eq!(request["method"], json!("chat.send"));
    assert_eq!(request["params"]["message"], json!("turn on the lights"));
    assert_eq!(request["params"]["idempotencyKey"], json!(task_id.as_str()));

    send_json(
        &mut ws,
        json!({"type": "res", "id": request["id"], "ok": true, "payload": {"runId": "run-7"}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "agent", "payload": {"runId": "run-7", "stream": "assistant", "data": {"text": "Lights on."}}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"type": "event", "event": "agent", "payload": {"runId": "run-7", "stream": "lifecycle", "data": {"phase": "end"}}}),
    )
    .await;

    let result = timeout(STEP, rx.recv()).await.unwrap();
    assert_eq!(
        result,
        Some(BridgeMessage::result(task_id.as_str(), "Lights on."))
    );

    bridge.shutdown();
    assert!(!bridge.is_gateway_connected());
}
