//! Transport and call session against an in-process signaling server.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sessionlink_core::models::{CallId, ConnectionId};
use sessionlink_rtc::{
    test_helpers::{registry_with, MockLinkFactory},
    CallSession, Error, SignalingTransport, StaticMediaSource, TransportConfig, TransportEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeServer {
    /// `connectionId` query of every accepted socket
    sockets: Mutex<Vec<String>>,
    /// Every request frame received
    requests: Mutex<Vec<Value>>,
    pings: Mutex<usize>,
    members: Mutex<Vec<String>>,
}

struct AppState {
    server: Arc<FakeServer>,
    push: broadcast::Sender<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let connection_id = query.get("connectionId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_socket(socket, connection_id, state))
}

async fn serve_socket(mut socket: WebSocket, connection_id: String, state: Arc<AppState>) {
    state.server.sockets.lock().push(connection_id);
    let mut push = state.push.subscribe();

    loop {
        tokio::select! {
            pushed = push.recv() => {
                let Ok(frame) = pushed else { return };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            message = socket.recv() => {
                let Some(Ok(Message::Text(text))) = message else { return };
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["type"] == "ping" {
                    *state.server.pings.lock() += 1;
                    let pong = json!({"type": "pong"}).to_string();
                    let _ = socket.send(Message::Text(pong.into())).await;
                    continue;
                }

                state.server.requests.lock().push(frame.clone());
                let id = frame["id"].clone();
                let reply = match frame["method"].as_str().unwrap_or_default() {
                    "slow" => continue,
                    "fail" => json!({"id": id, "error": "Video call not found", "details": "c1"}),
                    "drop" => {
                        let _ = socket
                            .send(Message::Text(json!({"id": id, "result": null}).to_string().into()))
                            .await;
                        return;
                    }
                    "videoCall.join" => {
                        let members = state.server.members.lock().clone();
                        json!({"id": id, "result": {
                            "videoCall": {
                                "id": frame["args"][0],
                                "creator": null,
                                "created": "2026-01-01T00:00:00Z",
                                "updated": "2026-01-01T00:00:00Z",
                                "connections": members,
                            },
                            "activeConnections": members,
                        }})
                    }
                    _ => json!({"id": id, "result": frame["args"]}),
                };
                if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn start_server() -> (String, Arc<FakeServer>, broadcast::Sender<String>) {
    let server = Arc::new(FakeServer::default());
    let (push, _) = broadcast::channel(64);
    let state = Arc::new(AppState {
        server: Arc::clone(&server),
        push: push.clone(),
    });
    let app = Router::new().route("/api/ws", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/api/ws"), server, push)
}

fn config(url: &str, id: &str) -> TransportConfig {
    let mut config = TransportConfig::new(url, ConnectionId::from(id));
    config.reconnect_delay_ms = 50;
    config.request_timeout_ms = 2_000;
    config
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_call_round_trip_and_server_events() {
    let (url, server, push) = start_server().await;
    let transport = SignalingTransport::new(config(&url, "tab-1"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    transport.on("videoCall", move |frame| sink.lock().push(frame.clone()));

    transport.connect().await.unwrap();
    assert!(transport.is_connected());
    assert_eq!(*server.sockets.lock(), vec!["tab-1".to_string()]);

    let result = transport.call("echo", vec![json!("a"), json!(1)]).await.unwrap();
    assert_eq!(result, json!(["a", 1]));

    let err = transport.call("fail", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Rpc { ref message, ref details }
        if message == "Video call not found" && details.as_deref() == Some("c1")));

    push.send(json!({"type": "videoCall", "id": "c1", "message": {"type": "chat", "data": "hi"}}).to_string())
        .unwrap();
    eventually(|| !seen.lock().is_empty()).await;
    assert_eq!(seen.lock()[0]["message"]["data"], "hi");

    let request_id = server.requests.lock()[0]["id"].as_str().unwrap().to_string();
    assert!(request_id.starts_with("msg_"));

    transport.disconnect().await;
}

#[tokio::test]
async fn test_request_times_out_and_is_forgotten() {
    let (url, _server, _push) = start_server().await;
    let mut config = config(&url, "tab-1");
    config.request_timeout_ms = 100;
    let transport = SignalingTransport::new(config);
    transport.connect().await.unwrap();

    let err = transport.call("slow", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(transport.pending_requests(), 0);

    transport.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_with_same_id_and_flushes_queue() {
    let (url, server, _push) = start_server().await;
    let transport = Arc::new(SignalingTransport::new(config(&url, "tab-7")));

    let events = Arc::new(Mutex::new(Vec::new()));
    for event in [TransportEvent::Connect, TransportEvent::Disconnect] {
        let sink = Arc::clone(&events);
        transport.on(event, move |_| sink.lock().push(event));
    }

    transport.connect().await.unwrap();
    transport.call("drop", vec![]).await.unwrap();
    eventually(|| !transport.is_connected()).await;

    // Queued while down, sent in order after the reconnect
    let first = transport.start_call("echo", vec![json!(1)]).unwrap();
    let second = transport.start_call("echo", vec![json!(2)]).unwrap();
    assert_eq!(first.wait().await.unwrap(), json!([1]));
    assert_eq!(second.wait().await.unwrap(), json!([2]));

    assert_eq!(*server.sockets.lock(), vec!["tab-7".to_string(), "tab-7".to_string()]);
    let args: Vec<Value> = server
        .requests
        .lock()
        .iter()
        .filter(|r| r["method"] == "echo")
        .map(|r| r["args"][0].clone())
        .collect();
    assert_eq!(args, vec![json!(1), json!(2)]);
    assert_eq!(
        *events.lock(),
        vec![TransportEvent::Connect, TransportEvent::Disconnect, TransportEvent::Connect]
    );

    transport.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_requests() {
    let (url, _server, _push) = start_server().await;
    let transport = Arc::new(SignalingTransport::new(config(&url, "tab-1")));
    transport.connect().await.unwrap();

    let pending = transport.start_call("slow", vec![]).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.disconnect().await;

    assert!(matches!(pending.wait().await, Err(Error::Closed)));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_session_join_opens_links_and_relays_signals() {
    let (url, server, push) = start_server().await;
    *server.members.lock() = vec!["alpha".to_string(), "mike".to_string(), "zulu".to_string()];

    let transport = Arc::new(SignalingTransport::new(config(&url, "local")));
    transport.connect().await.unwrap();
    // registry_with uses "local" as the local id
    let (registry, factory, outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
    let session = CallSession::new(Arc::clone(&transport), Arc::clone(&registry), outbox);

    let joined = session.join(&CallId::from("call-1")).await.unwrap();
    assert_eq!(joined.active_connections.len(), 3);
    assert_eq!(registry.len(), 3);

    // "local" < "mike" and "zulu": offers go to both; "alpha" offers to us
    assert!(!registry.get(&"alpha".into()).unwrap().is_initiator());
    assert!(registry.get(&"zulu".into()).unwrap().is_initiator());
    eventually(|| {
        server
            .requests
            .lock()
            .iter()
            .filter(|r| r["method"] == "videoCall.message" && r["args"][0]["data"]["event"] == "offer")
            .count()
            == 2
    })
    .await;
    let relayed = server
        .requests
        .lock()
        .iter()
        .find(|r| r["method"] == "videoCall.message")
        .cloned()
        .unwrap();
    assert_eq!(relayed["args"][0]["callId"], "call-1");
    assert_eq!(relayed["args"][0]["type"], "signal");

    // A remote offer is answered through the same path
    push.send(
        json!({"type": "videoCallSignal", "event": "offer", "connectionId": "alpha",
               "sdp": {"type": "offer", "sdp": "v=0"}})
        .to_string(),
    )
    .unwrap();
    eventually(|| {
        server
            .requests
            .lock()
            .iter()
            .any(|r| r["args"][0]["data"]["event"] == "answer" && r["args"][0]["data"]["connectionId"] == "alpha")
    })
    .await;

    push.send(json!({"type": "videoCallSignal", "event": "participant-left", "connectionId": "zulu"}).to_string())
        .unwrap();
    eventually(|| registry.get(&"zulu".into()).is_none()).await;
    assert!(factory.latest(&"zulu".into()).unwrap().is_closed());

    let categories: Vec<String> = session.log().into_iter().map(|e| e.category).collect();
    assert!(categories.contains(&"videoCallSignal".to_string()));

    session.leave().await.unwrap();
    assert!(registry.is_empty());
    assert!(session.call_id().is_none());
    assert!(server.requests.lock().iter().any(|r| r["method"] == "videoCall.leave"));

    transport.disconnect().await;
}
