//! Call-level glue between the signaling transport and the peer registry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use sessionlink_core::{
    models::{CallId, ConnectionId, VideoCall},
    protocol::{
        event_types, methods, CallBroadcast, JoinResult, ParticipantEvent, ParticipantUpdate,
        ServerEvent, Signal, VideoCallResult,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::SubscriptionId;
use crate::negotiation::is_initiator;
use crate::registry::PeerRegistry;
use crate::transport::{SignalingTransport, TransportEvent};
use crate::{Error, Result};

/// What the session reacts to, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Signal(Signal),
    Participant(ParticipantUpdate),
    Call(CallBroadcast),
    Connected,
    Disconnected,
}

impl SessionEvent {
    fn category(&self) -> &'static str {
        match self {
            Self::Signal(_) => event_types::VIDEO_CALL_SIGNAL,
            Self::Participant(_) => event_types::VIDEO_CALL_PARTICIPANT,
            Self::Call(_) => event_types::VIDEO_CALL,
            Self::Connected | Self::Disconnected => "system",
        }
    }

    fn summary(&self) -> String {
        match self {
            Self::Signal(signal) => format!("{} from {}", signal.kind(), signal.connection_id()),
            Self::Participant(update) => format!(
                "{} {} ({} in call)",
                update.connection_id,
                match update.event {
                    ParticipantEvent::Joined => "joined",
                    ParticipantEvent::Left => "left",
                },
                update.total_participants
            ),
            Self::Call(broadcast) => format!("{} message", broadcast.message.kind),
            Self::Connected => "signaling connected".to_string(),
            Self::Disconnected => "signaling disconnected".to_string(),
        }
    }
}

/// Timestamped record of something the session saw or did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionLogEntry {
    pub at: DateTime<Utc>,
    pub category: String,
    pub message: String,
}

/// Participation of the local client in at most one call at a time
pub struct CallSession {
    transport: Arc<SignalingTransport>,
    registry: Arc<PeerRegistry>,
    call_id: Mutex<Option<CallId>>,
    log: Mutex<Vec<SessionLogEntry>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    shutdown: CancellationToken,
}

impl CallSession {
    /// Wire `transport` and `registry` together. `outbox` is the receiver
    /// returned by [`PeerRegistry::new`].
    pub fn new(
        transport: Arc<SignalingTransport>,
        registry: Arc<PeerRegistry>,
        outbox: mpsc::UnboundedReceiver<Signal>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            transport,
            registry,
            call_id: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        session.subscribe(inbound_tx);
        tokio::spawn(run_inbound(Arc::downgrade(&session), inbound_rx, session.shutdown.clone()));
        tokio::spawn(run_outbox(Arc::downgrade(&session), outbox, session.shutdown.clone()));
        session
    }

    fn subscribe(&self, inbound: mpsc::UnboundedSender<SessionEvent>) {
        let mut ids = Vec::with_capacity(5);
        for event_type in [
            event_types::VIDEO_CALL_SIGNAL,
            event_types::VIDEO_CALL_PARTICIPANT,
            event_types::VIDEO_CALL,
        ] {
            let tx = inbound.clone();
            ids.push(self.transport.on(event_type, move |frame: &Value| {
                match serde_json::from_value::<ServerEvent>(frame.clone()) {
                    Ok(ServerEvent::VideoCallSignal(signal)) => {
                        let _ = tx.send(SessionEvent::Signal(signal));
                    }
                    Ok(ServerEvent::VideoCallParticipant(update)) => {
                        let _ = tx.send(SessionEvent::Participant(update));
                    }
                    Ok(ServerEvent::VideoCall(broadcast)) => {
                        let _ = tx.send(SessionEvent::Call(broadcast));
                    }
                    Ok(ServerEvent::Pong) => {}
                    Err(e) => warn!(error = %e, "Unrecognised server event"),
                }
            }));
        }

        let tx = inbound.clone();
        ids.push(self.transport.on(TransportEvent::Connect, move |_| {
            let _ = tx.send(SessionEvent::Connected);
        }));
        ids.push(self.transport.on(TransportEvent::Disconnect, move |_| {
            let _ = inbound.send(SessionEvent::Disconnected);
        }));

        self.subscriptions.lock().extend(ids);
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id.lock().clone()
    }

    /// Snapshot of everything logged so far
    #[must_use]
    pub fn log(&self) -> Vec<SessionLogEntry> {
        self.log.lock().clone()
    }

    fn record(&self, category: &str, message: impl Into<String>) {
        self.log.lock().push(SessionLogEntry {
            at: Utc::now(),
            category: category.to_string(),
            message: message.into(),
        });
    }

    /// Create a call listing `connections` as its initial members
    pub async fn create(&self, connections: Vec<ConnectionId>) -> Result<VideoCall> {
        let result = self
            .transport
            .call(methods::CREATE, vec![serde_json::to_value(&connections)?])
            .await?;
        let created: VideoCallResult = serde_json::from_value(result)?;
        self.record("system", format!("created call {}", created.video_call.id));
        Ok(created.video_call)
    }

    /// Join a call and open links to everyone already in it
    pub async fn join(self: &Arc<Self>, call_id: &CallId) -> Result<JoinResult> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let local = self.registry.local_id().clone();
        // Offers from existing members may arrive before the join reply;
        // answers to them need the call id already set.
        *self.call_id.lock() = Some(call_id.clone());
        let joined = match self
            .transport
            .call(methods::JOIN, vec![json!(call_id), json!(local)])
            .await
            .and_then(|result| Ok(serde_json::from_value::<JoinResult>(result)?))
        {
            Ok(joined) => joined,
            Err(e) => {
                self.call_id.lock().take();
                return Err(e);
            }
        };
        self.record(
            "system",
            format!("joined call {call_id} with {} participants", joined.active_connections.len()),
        );
        info!(call_id = %call_id, participants = joined.active_connections.len(), "Joined call");

        for remote in joined.active_connections.iter().filter(|c| **c != local) {
            let initiator = is_initiator(&local, remote);
            if let Err(e) = self.registry.create_or_get(remote, initiator).await {
                warn!(connection_id = %remote, error = %e, "Failed to open link to participant");
            }
        }
        Ok(joined)
    }

    /// Leave the current call, release every link and local capture, and
    /// stop listening to the transport. The session cannot join again.
    ///
    /// Local teardown happens even if the server call fails.
    pub async fn leave(&self) -> Result<()> {
        let call_id = self.call_id.lock().take();
        let outcome = match &call_id {
            Some(call_id) => {
                let local = self.registry.local_id().clone();
                self.transport
                    .call(methods::LEAVE, vec![json!(call_id), json!(local)])
                    .await
                    .map(|_| ())
            }
            None => Ok(()),
        };

        self.registry.close_all().await;
        self.close();
        if let Some(call_id) = call_id {
            self.record("system", format!("left call {call_id}"));
            info!(call_id = %call_id, "Left call");
        }
        outcome
    }

    /// Relay an application message to every member of the current call
    pub async fn send_message(&self, kind: &str, data: Value) -> Result<()> {
        let call_id = self
            .call_id()
            .ok_or_else(|| Error::NotFound("not in a call".to_string()))?;
        self.transport
            .call(
                methods::MESSAGE,
                vec![json!({ "callId": call_id, "type": kind, "data": data })],
            )
            .await
            .map(|_| ())
    }

    /// Stop reacting to transport events. The registry is left as is.
    pub fn close(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.transport.off(id);
        }
        self.shutdown.cancel();
    }

    async fn handle(&self, event: SessionEvent) {
        self.record(event.category(), event.summary());
        let local = self.registry.local_id().clone();

        match event {
            SessionEvent::Signal(signal) => {
                if signal.connection_id() == &local {
                    debug!(signal = signal.kind(), "Ignoring signal about ourselves");
                    return;
                }
                let kind = signal.kind();
                let from = signal.connection_id().clone();
                if let Err(e) = self.handle_signal(&local, signal).await {
                    warn!(connection_id = %from, signal = kind, error = %e, "Failed to handle signal");
                }
            }
            SessionEvent::Participant(update) => {
                if update.event == ParticipantEvent::Left && update.connection_id != local {
                    self.registry.close(&update.connection_id).await;
                }
            }
            SessionEvent::Call(broadcast) => {
                debug!(call_id = %broadcast.id, kind = %broadcast.message.kind, "Call message");
            }
            SessionEvent::Connected | SessionEvent::Disconnected => {}
        }
    }

    async fn handle_signal(&self, local: &ConnectionId, signal: Signal) -> Result<()> {
        match signal {
            Signal::Offer { connection_id, sdp } => self.registry.handle_offer(&connection_id, sdp).await,
            Signal::Answer { connection_id, sdp } => self.registry.handle_answer(&connection_id, sdp).await,
            Signal::IceCandidate {
                connection_id,
                candidate,
            } => self.registry.handle_ice_candidate(&connection_id, candidate).await,
            Signal::NewParticipant { connection_id } => {
                let initiator = is_initiator(local, &connection_id);
                self.registry.create_or_get(&connection_id, initiator).await.map(|_| ())
            }
            Signal::ParticipantLeft { connection_id } => {
                self.registry.close(&connection_id).await;
                Ok(())
            }
        }
    }

    /// Send a registry signal through the current call
    fn forward(&self, signal: &Signal) -> Result<()> {
        let call_id = self
            .call_id()
            .ok_or_else(|| Error::NotFound("not in a call".to_string()))?;
        let pending = self.transport.start_call(
            methods::MESSAGE,
            vec![json!({ "callId": call_id, "type": "signal", "data": signal })],
        )?;
        let kind = signal.kind();
        tokio::spawn(async move {
            if let Err(e) = pending.wait().await {
                warn!(signal = kind, error = %e, "Signal relay failed");
            }
        });
        Ok(())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_inbound(
    session: std::sync::Weak<CallSession>,
    mut inbound: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle(event).await;
    }
}

async fn run_outbox(
    session: std::sync::Weak<CallSession>,
    mut outbox: mpsc::UnboundedReceiver<Signal>,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            () = shutdown.cancelled() => break,
            signal = outbox.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        if let Err(e) = session.forward(&signal) {
            warn!(signal = signal.kind(), to = %signal.connection_id(), error = %e, "Dropping outbound signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionlink_core::protocol::SessionDescription;

    #[test]
    fn test_event_log_categories() {
        let signal = SessionEvent::Signal(Signal::Offer {
            connection_id: "peer".into(),
            sdp: SessionDescription::offer("v=0"),
        });
        assert_eq!(signal.category(), "videoCallSignal");
        assert_eq!(signal.summary(), "offer from peer");

        let joined = SessionEvent::Participant(ParticipantUpdate {
            event: ParticipantEvent::Joined,
            connection_id: "peer".into(),
            total_participants: 3,
        });
        assert_eq!(joined.category(), "videoCallParticipant");
        assert_eq!(joined.summary(), "peer joined (3 in call)");
        assert_eq!(SessionEvent::Connected.category(), "system");
    }
}
