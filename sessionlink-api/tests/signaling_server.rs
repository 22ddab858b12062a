//! End-to-end tests against a served router: real sockets, in-memory store.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sessionlink_api::{create_router, AppState, MethodRegistry};
use sessionlink_core::{
    config::{ServerConfig, SignalingConfig},
    models::{CallId, ConnectionId, VideoCall},
    repository::{CallStore, MemoryCallStore},
};
use sessionlink_signaling::{
    hub::{CLOSE_STALE, CLOSE_SUPERSEDED},
    CallMembershipCoordinator, ConnectionHub,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(2);

fn state() -> AppState {
    state_with(Arc::new(MemoryCallStore::new()))
}

fn state_with(store: Arc<dyn CallStore>) -> AppState {
    let coordinator = CallMembershipCoordinator::new(store, ConnectionHub::new(), Duration::from_millis(50));
    AppState::new(coordinator, MethodRegistry::with_video_call_methods(), SignalingConfig::default())
}

fn router(state: AppState) -> Router {
    create_router(state, &ServerConfig::default())
}

async fn serve(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u32,
}

impl Client {
    async fn connect(addr: SocketAddr, connection_id: &str) -> Self {
        let url = format!("ws://{addr}/api/ws?connectionId={connection_id}");
        let (ws, _) = connect_async(url.as_str()).await.unwrap();
        Self { ws, next_id: 0 }
    }

    async fn send(&mut self, frame: Value) {
        self.ws.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next JSON text frame, skipping transport pings
    async fn recv(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket ended")
                .unwrap();
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Skip frames until one satisfies `pred`
    async fn recv_until(&mut self, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let frame = self.recv().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for close")
                .expect("socket ended before close")
                .unwrap();
            if let Message::Close(frame) = message {
                return frame.map(CloseFrame::into_owned);
            }
        }
    }

    async fn call(&mut self, method: &str, args: Value) -> Value {
        self.next_id += 1;
        let id = format!("msg_test_{}", self.next_id);
        self.send(json!({ "id": id, "method": method, "args": args })).await;
        self.recv_until(|frame| frame["id"] == json!(id)).await
    }
}

#[tokio::test]
async fn test_missing_connection_id_is_rejected() {
    let addr = serve(state()).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/api/ws").as_str()).await.unwrap();

    let message = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 1008);
            assert_eq!(frame.reason, "Connection ID required");
        }
        other => panic!("expected policy close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_and_error_frames() {
    let addr = serve(state()).await;
    let mut client = Client::connect(addr, "tab-a").await;

    client.send(json!({ "type": "ping" })).await;
    assert_eq!(client.recv().await, json!({ "type": "pong" }));

    let reply = client.call("session.summarize", json!([])).await;
    assert_eq!(reply["error"], "Method session.summarize not found");

    client.send_raw("{not json").await;
    let reply = client.recv().await;
    assert_eq!(reply["error"], "Invalid message format");
    assert!(reply["details"].is_string());

    let reply = client.call("videoCall.join", json!(["missing-call"])).await;
    assert_eq!(reply["error"], "Video call not found");

    // The socket is still usable after errors
    client.send(json!({ "type": "ping" })).await;
    assert_eq!(client.recv().await["type"], "pong");
}

#[tokio::test]
async fn test_two_members_exchange_signals() {
    let addr = serve(state()).await;
    let mut a = Client::connect(addr, "tab-a").await;
    let mut b = Client::connect(addr, "tab-b").await;

    let created = a.call("videoCall.create", json!([["tab-a"]])).await;
    let call_id = created["result"]["videoCall"]["id"].as_str().unwrap().to_string();

    let joined = a.call("videoCall.join", json!([call_id])).await;
    assert_eq!(joined["result"]["activeConnections"], json!(["tab-a"]));

    let joined = b.call("videoCall.join", json!([call_id])).await;
    let active = joined["result"]["activeConnections"].as_array().unwrap().clone();
    assert_eq!(active.len(), 2);

    let update = a
        .recv_until(|f| f["type"] == "videoCallParticipant" && f["connectionId"] == "tab-b")
        .await;
    assert_eq!(update["event"], "joined");
    assert_eq!(update["totalParticipants"], 2);

    let announce = a.recv_until(|f| f["type"] == "videoCallSignal").await;
    assert_eq!(announce["event"], "new-participant");
    assert_eq!(announce["connectionId"], "tab-b");

    // B targets A; A sees the sender's id
    let offer = json!({
        "callId": call_id,
        "type": "signal",
        "data": {
            "event": "offer",
            "connectionId": "tab-a",
            "sdp": { "type": "offer", "sdp": "v=0 offer-b" }
        }
    });
    let reply = b.call("videoCall.message", json!([offer])).await;
    assert_eq!(reply["result"], json!({ "success": true }));

    let relayed = a.recv_until(|f| f["type"] == "videoCallSignal").await;
    assert_eq!(relayed["event"], "offer");
    assert_eq!(relayed["connectionId"], "tab-b");
    assert_eq!(relayed["sdp"]["sdp"], "v=0 offer-b");

    // Application messages go to every member, sender included
    let chat = json!({ "callId": call_id, "type": "chat", "data": { "text": "hello" } });
    a.call("videoCall.message", json!([chat])).await;
    let message = b.recv_until(|f| f["type"] == "videoCall").await;
    assert_eq!(message["id"], json!(call_id));
    assert_eq!(message["message"], json!({ "type": "chat", "data": { "text": "hello" } }));

    let reply = b.call("videoCall.leave", json!([call_id])).await;
    assert_eq!(reply["result"], json!({ "success": true }));

    let left = a
        .recv_until(|f| f["type"] == "videoCallParticipant" && f["event"] == "left")
        .await;
    assert_eq!(left["connectionId"], "tab-b");
    assert_eq!(left["totalParticipants"], 1);
    let signal = a.recv_until(|f| f["type"] == "videoCallSignal").await;
    assert_eq!(signal["event"], "participant-left");
}

/// Once armed, the next call lookup stalls
#[derive(Default)]
struct StallingStore {
    inner: MemoryCallStore,
    armed: AtomicBool,
}

#[async_trait]
impl CallStore for StallingStore {
    async fn create(&self, call: &VideoCall) -> sessionlink_core::Result<VideoCall> {
        self.inner.create(call).await
    }

    async fn get(&self, id: &CallId) -> sessionlink_core::Result<Option<VideoCall>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.inner.get(id).await
    }

    async fn replace_connections(&self, id: &CallId, connections: &[ConnectionId]) -> sessionlink_core::Result<()> {
        self.inner.replace_connections(id, connections).await
    }

    async fn remove_connections(&self, id: &CallId, connections: &[ConnectionId]) -> sessionlink_core::Result<()> {
        self.inner.remove_connections(id, connections).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_signals_from_one_socket_keep_their_order() {
    let store = Arc::new(StallingStore::default());
    let addr = serve(state_with(store.clone())).await;
    let mut a = Client::connect(addr, "tab-a").await;
    let mut b = Client::connect(addr, "tab-b").await;

    let created = a.call("videoCall.create", json!([["tab-a"]])).await;
    let call_id = created["result"]["videoCall"]["id"].as_str().unwrap().to_string();
    a.call("videoCall.join", json!([call_id])).await;
    b.call("videoCall.join", json!([call_id])).await;

    // The offer's lookup stalls; the candidate sent right after must still trail it
    store.armed.store(true, Ordering::SeqCst);
    let offer = json!({
        "callId": call_id,
        "type": "signal",
        "data": { "event": "offer", "connectionId": "tab-a", "sdp": { "type": "offer", "sdp": "v=0" } }
    });
    let candidate = json!({
        "callId": call_id,
        "type": "signal",
        "data": { "event": "ice-candidate", "connectionId": "tab-a", "candidate": { "candidate": "c1" } }
    });
    b.send(json!({ "id": "msg_offer", "method": "videoCall.message", "args": [offer] })).await;
    b.send(json!({ "id": "msg_candidate", "method": "videoCall.message", "args": [candidate] })).await;

    let relayed = |f: &Value| {
        f["type"] == "videoCallSignal" && (f["event"] == "offer" || f["event"] == "ice-candidate")
    };
    assert_eq!(a.recv_until(relayed).await["event"], "offer");
    assert_eq!(a.recv_until(relayed).await["event"], "ice-candidate");

    assert_eq!(b.recv_until(|f| f["id"] == "msg_offer").await["result"]["success"], true);
    assert_eq!(b.recv_until(|f| f["id"] == "msg_candidate").await["result"]["success"], true);
}

#[tokio::test]
async fn test_reused_connection_id_supersedes_older_socket() {
    let addr = serve(state()).await;
    let mut old = Client::connect(addr, "tab-dup").await;
    old.send(json!({ "type": "ping" })).await;
    old.recv().await;

    let mut new = Client::connect(addr, "tab-dup").await;
    let frame = old.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), CLOSE_SUPERSEDED);

    // Let the old socket's teardown run before checking the new one survived it
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut peer = Client::connect(addr, "tab-peer").await;
    let created = peer.call("videoCall.create", json!([])).await;
    let call_id = created["result"]["videoCall"]["id"].as_str().unwrap().to_string();
    new.call("videoCall.join", json!([call_id])).await;
    peer.call("videoCall.join", json!([call_id])).await;

    let announce = new.recv_until(|f| f["type"] == "videoCallSignal").await;
    assert_eq!(announce["connectionId"], "tab-peer");
}

#[tokio::test]
async fn test_stale_sockets_are_swept() {
    let state = state();
    let hub = state.coordinator.hub().clone();
    let addr = serve(state).await;
    let shutdown = CancellationToken::new();
    let sweeper = sessionlink_api::http::websocket::spawn_stale_sweeper(
        hub.clone(),
        Duration::from_millis(200),
        shutdown.clone(),
    );

    let mut client = Client::connect(addr, "tab-quiet").await;
    let frame = client.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), CLOSE_STALE);

    shutdown.cancel();
    sweeper.await.unwrap();
}

async fn post(app: Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_http_method_endpoint() {
    let app = router(state());

    let (status, body) = post(
        app.clone(),
        "/api/method",
        json!({ "method": "videoCall.create", "args": [["tab-a"]] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let call_id = body["videoCall"]["id"].clone();
    assert_eq!(body["videoCall"]["connections"], json!(["tab-a"]));

    let (status, body) = post(
        app.clone(),
        "/api/method",
        json!({ "method": "videoCall.join", "args": [call_id], "connectionId": "tab-a" }),
    )
    .await;
    // No socket is open for tab-a, so the join broadcast prunes it again
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["videoCall"]["id"], call_id);
    assert_eq!(body["activeConnections"], json!([]));

    let (status, body) = post(
        app.clone(),
        "/api/method",
        json!({ "method": "videoCall.get", "args": ["missing"] }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Video call not found");
    assert_eq!(body["status"], 404);

    let (status, body) = post(app, "/api/method", json!({ "method": "videoCall.leave", "args": [call_id] })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "connectionId is required");
}

#[tokio::test]
async fn test_health() {
    let app = router(state());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "status": "ok", "connections": 0 }));
}
