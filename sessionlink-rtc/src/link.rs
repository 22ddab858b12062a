//! Seam between the peer registry and the media stack.

use async_trait::async_trait;
use sessionlink_core::{
    models::ConnectionId,
    protocol::{IceCandidate, SessionDescription},
};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, RemoteTrack};
use crate::Result;

/// Identifies one link instance; a peer recreated under the same connection
/// id gets a new one, so late callbacks from the old link can be told apart.
pub type LinkId = u64;

/// Payload of the keepalive data channel
pub const HEARTBEAT_PAYLOAD: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    TrackAdded(RemoteTrack),
    ConnectionState(LinkConnectionState),
    IceState(IceConnectionState),
    /// Keepalive received from the remote side
    Heartbeat,
    /// Locally gathered candidate to forward to the remote side
    LocalCandidate(IceCandidate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub connection_id: ConnectionId,
    pub link_id: LinkId,
    pub kind: LinkEventKind,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One media session with one remote participant
#[async_trait]
pub trait MediaLink: Send + Sync {
    fn id(&self) -> LinkId;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swap the outgoing video source without renegotiating
    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()>;

    async fn send_heartbeat(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds media links; events for every link go to the given sender
#[async_trait]
pub trait MediaLinkFactory: Send + Sync {
    async fn open(
        &self,
        connection_id: &ConnectionId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MediaLink>>;
}
