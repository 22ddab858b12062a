//! Client-side call engine.
//!
//! This crate handles:
//! - One media link per remote participant ([`PeerRegistry`])
//! - Offer/answer/ICE exchange and the initiator tie-break
//! - Liveness supervision of every link
//! - The auto-reconnecting signaling socket ([`SignalingTransport`])
//! - Call-level glue between the two ([`CallSession`])
//!
//! Media I/O is abstracted behind [`MediaLinkFactory`] and [`MediaSource`];
//! [`WebRtcLinkFactory`] is the production link backend.

pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod liveness;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod session;
pub mod test_helpers;
pub mod transport;
pub mod webrtc_link;

pub use config::{IceServerConfig, RtcConfig, TransportConfig};
pub use error::{Error, Result};
pub use events::{EventBus, SubscriptionId};
pub use link::{LinkEvent, LinkEventKind, MediaLink, MediaLinkFactory};
pub use liveness::SweepReport;
pub use media::{
    LocalStream, LocalTrack, MediaSource, RemoteStream, RemoteTrack, StaticMediaSource, TrackKind,
    TrackSource,
};
pub use negotiation::{is_initiator, NegotiationState};
pub use peer::{PeerConnection, PeerStatus};
pub use registry::{PeerEvent, PeerEventKind, PeerRegistry, StreamEntry};
pub use session::{CallSession, SessionEvent, SessionLogEntry};
pub use transport::{PendingCall, SignalingTransport, TransportEvent};
pub use webrtc_link::WebRtcLinkFactory;
