//! Offer/answer/ICE exchange and outgoing-video swaps.
//!
//! State per peer: `new -> offer-sent | answer-pending -> negotiating ->
//! connected`, with `closed` terminal. Renegotiation after `connected` is not
//! modelled; screen share swaps the video source in place instead.

use serde::{Deserialize, Serialize};
use sessionlink_core::{
    models::ConnectionId,
    protocol::{IceCandidate, SessionDescription, Signal},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::media::LocalStream;
use crate::registry::{PeerEvent, PeerRegistry};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    New,
    OfferSent,
    AnswerPending,
    Negotiating,
    Connected,
    Closed,
}

/// Deterministic initiator choice: the lexicographically smaller id offers
#[must_use]
pub fn is_initiator(local: &ConnectionId, remote: &ConnectionId) -> bool {
    local < remote
}

fn not_found(connection_id: &ConnectionId) -> Error {
    Error::NotFound(connection_id.to_string())
}

impl PeerRegistry {
    /// Create and commit a local offer, then send it to the peer
    pub async fn send_offer(&self, connection_id: &ConnectionId) -> Result<()> {
        let peer = self.get(connection_id).ok_or_else(|| not_found(connection_id))?;

        let offer = peer.link().create_offer().await?;
        if !self.is_current(&peer) {
            debug!(connection_id = %connection_id, "Peer replaced while creating offer, dropping it");
            return Ok(());
        }

        peer.set_negotiation_state(NegotiationState::OfferSent);
        self.send_signal(Signal::Offer {
            connection_id: connection_id.clone(),
            sdp: offer,
        });
        debug!(connection_id = %connection_id, "Offer sent");
        Ok(())
    }

    /// Accept a remote offer, creating the peer as non-initiator if needed,
    /// and answer it
    pub async fn handle_offer(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        sdp: SessionDescription,
    ) -> Result<()> {
        let peer = self.create_or_get(connection_id, false).await?;
        peer.set_negotiation_state(NegotiationState::AnswerPending);

        let link = peer.link();
        link.set_remote_description(sdp).await?;
        let answer = link.create_answer().await?;

        if !self.is_current(&peer) {
            debug!(connection_id = %connection_id, "Peer replaced while answering, dropping answer");
            return Ok(());
        }
        peer.set_negotiation_state(NegotiationState::Negotiating);
        self.send_signal(Signal::Answer {
            connection_id: connection_id.clone(),
            sdp: answer,
        });
        debug!(connection_id = %connection_id, "Answer sent");
        Ok(())
    }

    pub async fn handle_answer(&self, connection_id: &ConnectionId, sdp: SessionDescription) -> Result<()> {
        let peer = self.get(connection_id).ok_or_else(|| not_found(connection_id))?;
        peer.link().set_remote_description(sdp).await?;
        peer.set_negotiation_state(NegotiationState::Negotiating);
        debug!(connection_id = %connection_id, "Answer applied");
        Ok(())
    }

    pub async fn handle_ice_candidate(
        &self,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let peer = self.get(connection_id).ok_or_else(|| not_found(connection_id))?;
        peer.link().add_ice_candidate(candidate).await
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.local_media.read().await.screen.is_some()
    }

    /// Replace the outgoing video on every peer with a screen capture.
    ///
    /// The swap runs under the local-media write lock, so a peer created
    /// concurrently attaches either the camera before the swap (and is
    /// swapped) or the screen after it.
    pub async fn start_screen_share(&self) -> Result<LocalStream> {
        if let Some(screen) = self.local_media.read().await.screen.clone() {
            return Ok(screen);
        }
        let screen = self.media_source.display_media().await?;
        let Some(track) = screen.video_track().cloned() else {
            screen.stop();
            return Err(Error::MediaUnavailable("Screen capture has no video track".to_string()));
        };

        let mut media = self.local_media.write().await;
        if let Some(existing) = media.screen.clone() {
            screen.stop();
            return Ok(existing);
        }

        let peers: Vec<_> = self.peers.iter().map(|p| Arc::clone(&p)).collect();
        for peer in &peers {
            if let Err(e) = peer.link().replace_video_track(Some(&track)).await {
                warn!(connection_id = %peer.connection_id(), error = %e, "Failed to switch peer to screen share");
            }
        }
        media.screen = Some(screen.clone());
        drop(media);

        info!(peers = peers.len(), "Screen share started");
        self.emit(PeerEvent::LocalStreamChanged {
            stream: Some(screen.clone()),
        });
        Ok(screen)
    }

    /// End the screen share and put the camera video back on every peer
    pub async fn stop_screen_share(&self) -> Result<()> {
        let mut media = self.local_media.write().await;
        let Some(screen) = media.screen.take() else {
            return Ok(());
        };
        screen.stop();

        let camera_video = media
            .camera
            .as_ref()
            .and_then(LocalStream::video_track)
            .cloned();
        let peers: Vec<_> = self.peers.iter().map(|p| Arc::clone(&p)).collect();
        for peer in &peers {
            if let Err(e) = peer.link().replace_video_track(camera_video.as_ref()).await {
                warn!(connection_id = %peer.connection_id(), error = %e, "Failed to restore camera video");
            }
        }
        let active = media.active_stream();
        drop(media);

        info!(peers = peers.len(), "Screen share stopped");
        self.emit(PeerEvent::LocalStreamChanged { stream: active });
        Ok(())
    }
}
