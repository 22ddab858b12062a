//! Peer liveness supervision.
//!
//! Any inbound activity (remote track, connected state, ICE connected,
//! keepalive received) refreshes a peer. A periodic sweep marks peers silent
//! for the stale threshold as stale and closes those silent for the dead
//! threshold.

use sessionlink_core::models::ConnectionId;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::peer::{PeerConnection, PeerStatus};
use crate::registry::{PeerEvent, PeerRegistry};

/// Result of one liveness sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<ConnectionId>,
    pub dead: Vec<ConnectionId>,
}

impl PeerRegistry {
    pub(crate) fn record_activity(&self, peer: &PeerConnection) {
        if peer.touch() {
            debug!(connection_id = %peer.connection_id(), "Peer recovered");
            self.emit(PeerEvent::StatusChanged {
                connection_id: peer.connection_id().clone(),
                status: PeerStatus::Active,
            });
        }
    }

    /// Start the periodic sweep if it is not already running
    pub(crate) fn ensure_liveness_monitor(self: &Arc<Self>) {
        let mut slot = self.liveness.lock();
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let interval = self.config.health_check_interval();
        tokio::spawn(run_liveness_monitor(Arc::downgrade(self), interval, token));
        debug!(?interval, "Liveness monitor started");
    }

    pub(crate) fn stop_liveness_monitor(&self) {
        if let Some(token) = self.liveness.lock().take() {
            token.cancel();
        }
    }

    /// Classify every peer by time since its last activity and close the
    /// dead ones.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let stale_after = self.config.stale_threshold();
        let dead_after = self.config.dead_threshold();
        let peers: Vec<Arc<PeerConnection>> = self.peers.iter().map(|p| Arc::clone(&p)).collect();

        let mut report = SweepReport::default();
        for peer in peers {
            let silent_for = now.saturating_duration_since(peer.last_activity());
            let connection_id = peer.connection_id().clone();

            if silent_for >= dead_after {
                info!(connection_id = %connection_id, ?silent_for, "Peer unresponsive, closing");
                if peer.set_status(PeerStatus::Dead) {
                    self.emit(PeerEvent::StatusChanged {
                        connection_id: connection_id.clone(),
                        status: PeerStatus::Dead,
                    });
                }
                self.close_link(&connection_id, Some(peer.link_id())).await;
                report.dead.push(connection_id);
            } else if silent_for >= stale_after && peer.mark_stale_if_silent(now, stale_after) {
                debug!(connection_id = %connection_id, ?silent_for, "Peer stale");
                self.emit(PeerEvent::StatusChanged {
                    connection_id: connection_id.clone(),
                    status: PeerStatus::Stale,
                });
                report.stale.push(connection_id);
            }
        }
        report
    }
}

async fn run_liveness_monitor(
    registry: Weak<PeerRegistry>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let report = registry.sweep().await;
        if !report.dead.is_empty() {
            debug!(closed = report.dead.len(), "Liveness sweep closed peers");
        }
    }
    trace!("Liveness monitor stopped");
}
