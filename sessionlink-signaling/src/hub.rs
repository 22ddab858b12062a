use dashmap::DashMap;
use parking_lot::Mutex;
use sessionlink_core::{models::ConnectionId, protocol::ServerEvent};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Close code sent to a socket replaced by a newer one with the same id
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent to sockets that stopped pinging
pub const CLOSE_STALE: u16 = 4001;

/// Frame queued for a socket's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type OutboundSender = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// No socket registered under the id
    NotConnected,
    /// Socket registered but its writer is gone
    Closed,
    /// Outbound buffer full; the frame was dropped
    Backpressure,
}

impl DeliveryError {
    /// Whether the recipient should be treated as gone
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed)
    }
}

/// Result of a fan-out
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub successful: Vec<ConnectionId>,
    /// Recipients with no open socket; callers prune these from membership
    pub invalid: Vec<ConnectionId>,
    /// Recipients whose buffer was full; still connected
    pub dropped: Vec<ConnectionId>,
}

/// Token returned by [`ConnectionHub::register`]. Unregistering with a stale
/// handle is a no-op, so a superseded socket cannot evict its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub generation: u64,
}

struct ConnectionEntry {
    generation: u64,
    sender: OutboundSender,
    last_ping: Mutex<Instant>,
}

/// Registry of open signaling sockets keyed by connection id
#[derive(Clone, Default)]
pub struct ConnectionHub {
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    next_generation: Arc<AtomicU64>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound channel. A previous socket with the same
    /// id is told to close.
    pub fn register(&self, connection_id: ConnectionId, sender: OutboundSender) -> ConnectionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ConnectionEntry {
            generation,
            sender,
            last_ping: Mutex::new(Instant::now()),
        };

        if let Some(previous) = self.connections.insert(connection_id.clone(), entry) {
            warn!(
                connection_id = %connection_id,
                previous_generation = previous.generation,
                "Connection id reused, closing previous socket"
            );
            let _ = previous.sender.try_send(Outbound::Close {
                code: CLOSE_SUPERSEDED,
                reason: "Superseded by a newer connection".to_string(),
            });
        }

        info!(connection_id = %connection_id, generation, "Connection registered");

        ConnectionHandle {
            connection_id,
            generation,
        }
    }

    /// Remove the socket if it is still the current one for its id
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let removed = self
            .connections
            .remove_if(&handle.connection_id, |_, entry| entry.generation == handle.generation)
            .is_some();

        if removed {
            info!(connection_id = %handle.connection_id, "Connection unregistered");
        } else {
            debug!(
                connection_id = %handle.connection_id,
                generation = handle.generation,
                "Skipped unregister of superseded connection"
            );
        }
        removed
    }

    /// Record a client ping
    pub fn touch(&self, connection_id: &ConnectionId) {
        if let Some(entry) = self.connections.get(connection_id) {
            *entry.last_ping.lock() = Instant::now();
        }
    }

    #[must_use]
    pub fn is_connected(&self, connection_id: &ConnectionId) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|entry| !entry.sender.is_closed())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue a pre-serialized frame for one connection
    pub fn send_text(&self, connection_id: &ConnectionId, text: String) -> Result<(), DeliveryError> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or(DeliveryError::NotConnected)?;

        match entry.sender.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection_id,
                    "Outbound buffer full, dropping frame"
                );
                Err(DeliveryError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Serialize and queue an event for one connection
    pub fn send_to(&self, connection_id: &ConnectionId, event: &ServerEvent) -> Result<(), DeliveryError> {
        let text = serialize(event).ok_or(DeliveryError::Closed)?;
        self.send_text(connection_id, text)
    }

    /// Fan an event out to `recipients`, reporting who could not be reached
    pub fn broadcast<'a, I>(&self, recipients: I, event: &ServerEvent) -> BroadcastOutcome
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let mut outcome = BroadcastOutcome::default();
        let Some(text) = serialize(event) else {
            return outcome;
        };

        for connection_id in recipients {
            match self.send_text(connection_id, text.clone()) {
                Ok(()) => outcome.successful.push(connection_id.clone()),
                Err(err) if err.is_unreachable() => {
                    debug!(
                        connection_id = %connection_id,
                        event_type = event.event_type(),
                        "Broadcast target unreachable"
                    );
                    outcome.invalid.push(connection_id.clone());
                }
                Err(_) => outcome.dropped.push(connection_id.clone()),
            }
        }

        if !outcome.invalid.is_empty() {
            debug!(
                event_type = event.event_type(),
                sent = outcome.successful.len(),
                invalid = outcome.invalid.len(),
                "Broadcast complete with unreachable targets"
            );
        }

        outcome
    }

    /// Close and drop sockets whose last ping is older than `max_age`
    pub fn close_stale(&self, max_age: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale: Vec<(ConnectionId, u64)> = self
            .connections
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.last_ping.lock()) > max_age)
            .map(|entry| (entry.key().clone(), entry.generation))
            .collect();

        let mut closed = Vec::with_capacity(stale.len());
        for (connection_id, generation) in stale {
            if let Some((_, entry)) = self
                .connections
                .remove_if(&connection_id, |_, entry| entry.generation == generation)
            {
                let _ = entry.sender.try_send(Outbound::Close {
                    code: CLOSE_STALE,
                    reason: "Connection timed out".to_string(),
                });
                info!(connection_id = %connection_id, "Closed stale connection");
                closed.push(connection_id);
            }
        }
        closed
    }
}

fn serialize(event: &ServerEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(error = %err, event_type = event.event_type(), "Failed to serialize event");
            None
        }
    }
}
