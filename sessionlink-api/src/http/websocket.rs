//! Signaling WebSocket.
//!
//! One socket per client tab, keyed by the `connectionId` query parameter.
//! Text frames carry JSON: `{"type":"ping"}` keepalives and
//! `{"id","method","args","params"}` requests. Server-push events reach the
//! socket through the connection hub.
//!
//! Requests from one socket are dispatched one at a time, in arrival order,
//! so an offer relayed before an ICE candidate reaches the target first.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sessionlink_core::{
    models::ConnectionId,
    protocol::{event_types, RpcRequest, ServerEvent},
};
use sessionlink_signaling::{ConnectionHub, Outbound};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::methods::MethodContext;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub connection_id: Option<String>,
    /// Accepted for client compatibility; calls are not authenticated
    pub token: Option<String>,
}

/// `GET /api/ws?connectionId=…`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ws = ws.max_message_size(state.signaling.max_message_size);

    let Some(connection_id) = query
        .connection_id
        .map(ConnectionId::from)
        .filter(|id| !id.is_blank())
    else {
        debug!("Rejecting WebSocket without connectionId");
        return ws.on_upgrade(|mut socket| async move {
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: "Connection ID required".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
        });
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, connection_id: ConnectionId) {
    let hub = state.coordinator.hub().clone();

    // Bounded buffer: a client too slow to drain it loses frames instead of
    // growing server memory
    let (tx, rx) = mpsc::channel::<Outbound>(state.signaling.outbound_buffer);
    let handle = hub.register(connection_id.clone(), tx.clone());
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        state.signaling.ws_ping_interval(),
        connection_id.clone(),
    ));

    let (requests, pending) = mpsc::channel::<RpcRequest>(state.signaling.outbound_buffer);
    tokio::spawn(dispatch_loop(state.clone(), connection_id.clone(), tx.clone(), pending));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Some(request) = handle_text(&hub, &connection_id, &tx, text.as_str()) else {
                    continue;
                };
                if requests.send(request).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    // Queued requests still run; their replies are dropped with the writer
    drop(requests);
    hub.unregister(&handle);
    writer.abort();
    info!(connection_id = %connection_id, "WebSocket connection closed");
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(connection_id = %connection_id, error = %e, "Failed to send WebSocket message");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn reply(tx: &mpsc::Sender<Outbound>, connection_id: &ConnectionId, text: String) {
    match tx.try_send(Outbound::Text(text)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            warn!(connection_id = %connection_id, "Outbound buffer full, dropping reply");
        }
        Err(TrySendError::Closed(_)) => {
            debug!(connection_id = %connection_id, "Socket writer gone, dropping reply");
        }
    }
}

fn invalid_format(tx: &mpsc::Sender<Outbound>, connection_id: &ConnectionId, details: String) {
    let body = json!({ "error": "Invalid message format", "details": details });
    reply(tx, connection_id, body.to_string());
}

/// Answer pings and malformed frames inline; hand back method requests
fn handle_text(
    hub: &ConnectionHub,
    connection_id: &ConnectionId,
    tx: &mpsc::Sender<Outbound>,
    text: &str,
) -> Option<RpcRequest> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Malformed frame");
            invalid_format(tx, connection_id, e.to_string());
            return None;
        }
    };

    if frame.get("type").and_then(Value::as_str) == Some(event_types::PING) {
        hub.touch(connection_id);
        match serde_json::to_string(&ServerEvent::Pong) {
            Ok(pong) => reply(tx, connection_id, pong),
            Err(e) => error!(error = %e, "Failed to encode pong"),
        }
        return None;
    }

    if frame.get("method").is_none() {
        debug!(connection_id = %connection_id, "Ignoring frame without method");
        return None;
    }

    match serde_json::from_value(frame) {
        Ok(request) => Some(request),
        Err(e) => {
            invalid_format(tx, connection_id, e.to_string());
            None
        }
    }
}

/// Run one socket's requests sequentially until its reader hangs up
async fn dispatch_loop(
    state: AppState,
    connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    mut pending: mpsc::Receiver<RpcRequest>,
) {
    let ctx = MethodContext {
        coordinator: state.coordinator.clone(),
        connection_id: Some(connection_id.clone()),
    };
    while let Some(request) = pending.recv().await {
        let response = state.methods.dispatch(ctx.clone(), request).await;
        match serde_json::to_string(&response) {
            Ok(text) => reply(&tx, &connection_id, text),
            Err(e) => error!(error = %e, "Failed to encode method response"),
        }
    }
}

/// Periodically close sockets whose last client ping is older than `interval`
pub fn spawn_stale_sweeper(hub: ConnectionHub, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = hub.close_stale(interval);
                    if !closed.is_empty() {
                        info!(count = closed.len(), "Closed stale WebSocket connections");
                    }
                }
            }
        }
    })
}
