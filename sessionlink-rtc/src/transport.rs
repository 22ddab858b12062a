//! Auto-reconnecting signaling socket.
//!
//! Requests are correlated by id and bounded by the request timeout.
//! Server-push frames are fanned out by their `type` through an event bus;
//! `connect`, `disconnect` and `error` are raised on the same bus. Frames
//! written while the socket is down queue and flush in order on reconnect.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sessionlink_core::{
    models::ConnectionId,
    protocol::{event_types, RpcRequest, RpcResponse},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = DashMap<String, oneshot::Sender<RpcResponse>>;

/// Events raised by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connect,
    Disconnect,
    Error,
}

impl TransportEvent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

impl From<TransportEvent> for String {
    fn from(event: TransportEvent) -> Self {
        event.as_str().to_string()
    }
}

/// State shared between the handle and the connection supervisor
struct Shared {
    pending: PendingMap,
    events: EventBus<String, Value>,
    connected: AtomicBool,
}

impl Shared {
    fn emit(&self, event: &str, payload: &Value) {
        self.events.emit(&event.to_string(), payload);
    }

    /// Route one inbound text frame
    fn dispatch(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable frame");
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_owned) {
            if let Some((_, waiter)) = self.pending.remove(id.as_str()) {
                match serde_json::from_value::<RpcResponse>(value) {
                    Ok(response) => {
                        let _ = waiter.send(response);
                    }
                    Err(e) => warn!(request_id = id.as_str(), error = %e, "Malformed response"),
                }
                return;
            }
        }

        match value.get("type").and_then(Value::as_str) {
            Some(event_types::PONG) => trace!("Pong received"),
            Some(kind) => {
                let kind = kind.to_string();
                let delivered = self.events.emit(&kind, &value);
                trace!(event_type = %kind, delivered, "Server event");
            }
            None if value.get("error").is_some() => {
                warn!(frame = %value, "Server reported an error");
                self.emit(TransportEvent::Error.as_str(), &value);
            }
            None => debug!(frame = %value, "Unroutable frame"),
        }
    }
}

/// Client side of the signaling socket
pub struct SignalingTransport {
    config: TransportConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    request_counter: AtomicU64,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Shared {
                pending: DashMap::new(),
                events: EventBus::new(),
                connected: AtomicBool::new(false),
            }),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            request_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.config.connection_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Open the socket and keep it open until [`disconnect`](Self::disconnect).
    ///
    /// Fails if the first attempt fails; later drops are retried every
    /// `reconnect_delay` with the same connection id. Calling it again while
    /// running is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        if self.supervisor.lock().is_some() {
            return Ok(());
        }

        let endpoint = self.config.endpoint()?;
        let (socket, _response) = connect_async(endpoint.as_str()).await?;

        let Some(outbound_rx) = self.outbound_rx.lock().take() else {
            return Ok(());
        };
        info!(connection_id = %self.config.connection_id, "Signaling connected");
        self.shared.connected.store(true, Ordering::Release);
        self.shared.emit(TransportEvent::Connect.as_str(), &Value::Null);

        let supervisor = Supervisor {
            endpoint: endpoint.to_string(),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            outbound: outbound_rx,
            backlog: VecDeque::new(),
            shutdown: self.shutdown.clone(),
        };
        *self.supervisor.lock() = Some(tokio::spawn(supervisor.run(socket)));
        Ok(())
    }

    /// Stop reconnecting, close the socket and fail every pending request
    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        self.shared.pending.clear();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Signaling supervisor ended abnormally");
            }
        }
        self.shared.connected.store(false, Ordering::Release);
    }

    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.events.on(event.into(), handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.events.off(id)
    }

    /// Queue a raw frame. Delivered in order once the socket is up.
    pub fn send(&self, frame: &Value) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let text = serde_json::to_string(frame)?;
        self.outbound.send(text).map_err(|_| Error::Closed)
    }

    /// Invoke a server method and wait for its result.
    ///
    /// The timeout runs from this call, so time spent queued while
    /// disconnected counts against it.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.start_call(method, args)?.wait().await
    }

    /// Queue a request now and return a handle to await its result.
    ///
    /// Requests started in sequence are written in that order.
    pub fn start_call(&self, method: &str, args: Vec<Value>) -> Result<PendingCall> {
        let timeout = self.config.request_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.next_request_id();
        let request = RpcRequest {
            id: Some(id.clone()),
            method: method.to_string(),
            args,
            params: None,
        };
        let frame = serde_json::to_value(&request)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), tx);
        if let Err(e) = self.send(&frame) {
            self.shared.pending.remove(&id);
            return Err(e);
        }
        trace!(request_id = %id, method, "Request queued");

        Ok(PendingCall {
            id,
            method: method.to_string(),
            timeout,
            deadline,
            response: rx,
            shared: Arc::clone(&self.shared),
        })
    }

    fn next_request_id(&self) -> String {
        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg_{}_{counter}", chrono::Utc::now().timestamp_millis())
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

/// Request written (or queued) and awaiting its response
pub struct PendingCall {
    id: String,
    method: String,
    timeout: Duration,
    deadline: tokio::time::Instant,
    response: oneshot::Receiver<RpcResponse>,
    shared: Arc<Shared>,
}

impl PendingCall {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(self) -> Result<Value> {
        match tokio::time::timeout_at(self.deadline, self.response).await {
            Ok(Ok(response)) => match response.error {
                Some(message) => Err(Error::Rpc {
                    message,
                    details: response.details,
                }),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.shared.pending.remove(&self.id);
                warn!(request_id = %self.id, method = %self.method, timeout = ?self.timeout, "Request timed out");
                Err(Error::Timeout {
                    method: self.method,
                    after: self.timeout,
                })
            }
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the socket for its whole lifetime, reconnecting on loss
struct Supervisor {
    endpoint: String,
    config: TransportConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<String>,
    /// Frames taken from the queue whose write failed; resent first
    backlog: VecDeque<String>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self, socket: Socket) {
        let mut socket = Some(socket);
        loop {
            if let Some(active) = socket.take() {
                let reason = self.pump(active).await;
                self.shared.connected.store(false, Ordering::Release);
                info!(connection_id = %self.config.connection_id, reason, "Signaling disconnected");
                self.shared
                    .emit(TransportEvent::Disconnect.as_str(), &json!({ "reason": reason }));
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }

            match connect_async(self.endpoint.as_str()).await {
                Ok((active, _response)) => {
                    info!(
                        connection_id = %self.config.connection_id,
                        queued = self.backlog.len() + self.outbound.len(),
                        "Signaling reconnected"
                    );
                    self.shared.connected.store(true, Ordering::Release);
                    self.shared.emit(TransportEvent::Connect.as_str(), &Value::Null);
                    socket = Some(active);
                }
                Err(e) => {
                    debug!(error = %e, "Reconnect attempt failed");
                    self.shared
                        .emit(TransportEvent::Error.as_str(), &json!({ "error": e.to_string() }));
                }
            }
        }
        trace!("Signaling supervisor stopped");
    }

    /// Drive one socket until it closes. Returns the reason.
    async fn pump(&mut self, socket: Socket) -> &'static str {
        let (mut writer, mut reader) = socket.split();

        while let Some(frame) = self.backlog.pop_front() {
            if writer.send(Message::Text(frame.clone())).await.is_err() {
                self.backlog.push_front(frame);
                return "write failed";
            }
        }

        let mut keepalive = tokio::time::interval(self.config.ping_interval());
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        let ping = json!({ "type": event_types::PING }).to_string();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return "closed by client";
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return "transport dropped";
                    };
                    if writer.send(Message::Text(frame.clone())).await.is_err() {
                        self.backlog.push_back(frame);
                        return "write failed";
                    }
                }
                _ = keepalive.tick() => {
                    if writer.send(Message::Text(ping.clone())).await.is_err() {
                        return "keepalive failed";
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(Message::Text(text))) => self.shared.dispatch(&text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = writer.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return "closed by server",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling read error");
                        return "read error";
                    }
                },
            }
        }
    }
}
