//! Per-participant connection state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sessionlink_core::models::ConnectionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::link::{LinkId, MediaLink};
use crate::media::{RemoteStream, RemoteTrack};
use crate::negotiation::NegotiationState;

/// Liveness classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Stale,
    Dead,
}

/// Media link to one remote participant plus its bookkeeping
pub struct PeerConnection {
    connection_id: ConnectionId,
    link: Arc<dyn MediaLink>,
    is_initiator: bool,
    connected: AtomicBool,
    remote_stream: Mutex<RemoteStream>,
    last_activity: Mutex<Instant>,
    status: Mutex<PeerStatus>,
    negotiation: Mutex<NegotiationState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub fn new(connection_id: ConnectionId, link: Arc<dyn MediaLink>, is_initiator: bool) -> Self {
        Self {
            connection_id,
            link,
            is_initiator,
            connected: AtomicBool::new(false),
            remote_stream: Mutex::new(RemoteStream::default()),
            last_activity: Mutex::new(Instant::now()),
            status: Mutex::new(PeerStatus::Active),
            negotiation: Mutex::new(NegotiationState::New),
            heartbeat: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn link(&self) -> Arc<dyn MediaLink> {
        Arc::clone(&self.link)
    }

    #[must_use]
    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    #[must_use]
    pub const fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Snapshot of the inbound tracks
    #[must_use]
    pub fn remote_stream(&self) -> RemoteStream {
        self.remote_stream.lock().clone()
    }

    #[must_use]
    pub fn has_remote_media(&self) -> bool {
        !self.remote_stream.lock().is_empty()
    }

    pub(crate) fn add_remote_track(&self, track: RemoteTrack) -> bool {
        self.remote_stream.lock().add_track(track)
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    #[must_use]
    pub fn status(&self) -> PeerStatus {
        *self.status.lock()
    }

    /// Record activity. Returns true when this revived a stale peer.
    pub fn touch(&self) -> bool {
        *self.last_activity.lock() = Instant::now();
        let mut status = self.status.lock();
        if *status == PeerStatus::Stale {
            *status = PeerStatus::Active;
            return true;
        }
        false
    }

    /// Move an active peer to stale if it has still been silent for
    /// `stale_after` as of `now`. Activity recorded after `now` keeps it
    /// active. Returns true only for the transition.
    pub(crate) fn mark_stale_if_silent(&self, now: Instant, stale_after: Duration) -> bool {
        let mut status = self.status.lock();
        if *status != PeerStatus::Active {
            return false;
        }
        if now.saturating_duration_since(self.last_activity()) < stale_after {
            return false;
        }
        *status = PeerStatus::Stale;
        true
    }

    /// Returns true if the status changed
    pub(crate) fn set_status(&self, new_status: PeerStatus) -> bool {
        let mut status = self.status.lock();
        if *status == new_status {
            return false;
        }
        *status = new_status;
        true
    }

    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock()
    }

    pub(crate) fn set_negotiation_state(&self, state: NegotiationState) {
        let mut current = self.negotiation.lock();
        if *current != NegotiationState::Closed {
            trace!(connection_id = %self.connection_id, from = ?*current, to = ?state, "Negotiation state");
            *current = state;
        }
    }

    /// Send a keepalive over the link every `interval` until stopped
    pub(crate) fn start_heartbeat(&self, interval: Duration) {
        let link = Arc::clone(&self.link);
        let connection_id = self.connection_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = link.send_heartbeat().await {
                    trace!(connection_id = %connection_id, error = %e, "Heartbeat send failed");
                }
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("connection_id", &self.connection_id)
            .field("link_id", &self.link.id())
            .field("is_initiator", &self.is_initiator)
            .field("connected", &self.is_connected())
            .field("status", &self.status())
            .field("negotiation", &self.negotiation_state())
            .finish_non_exhaustive()
    }
}
