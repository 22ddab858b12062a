//! `webrtc`-backed media links.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sessionlink_core::{
    models::ConnectionId,
    protocol::{IceCandidate, SdpType, SessionDescription},
};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::RtcConfig;
use crate::link::{
    IceConnectionState, LinkConnectionState, LinkEvent, LinkEventKind, LinkEventSender, LinkId,
    MediaLink, MediaLinkFactory, HEARTBEAT_PAYLOAD,
};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::{Error, Result};

/// Pre-negotiated keepalive data channel id, identical on both sides
pub const KEEPALIVE_CHANNEL_ID: u16 = 100;
const KEEPALIVE_LABEL: &str = "keepalive";
const STREAM_ID: &str = "sessionlink";

type RemoteTrackKey = (ConnectionId, String);

/// Remote tracks keyed by participant and track id, tagged with the link
/// that received them
type RemoteTrackMap<T> = DashMap<RemoteTrackKey, (LinkId, T)>;

/// Forget the tracks `link_id` received. A newer link for the same
/// participant keeps its entries.
fn release_link_tracks<T>(tracks: &RemoteTrackMap<T>, connection_id: &ConnectionId, link_id: LinkId) {
    tracks.retain(|(owner, _), (received_by, _)| !(owner == connection_id && *received_by == link_id));
}

/// Opens one `RTCPeerConnection` per remote participant.
///
/// Local tracks map to shared `TrackLocalStaticSample`s: write samples once
/// through [`Self::sample_track`] and every link that carries the track sends
/// them.
pub struct WebRtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    local_tracks: Arc<DashMap<String, Arc<TrackLocalStaticSample>>>,
    remote_tracks: Arc<RemoteTrackMap<Arc<TrackRemote>>>,
}

impl WebRtcLinkFactory {
    pub fn new(config: &RtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            local_tracks: Arc::new(DashMap::new()),
            remote_tracks: Arc::new(DashMap::new()),
        })
    }

    /// Sample sink for a local track, created on first use
    pub fn sample_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        sample_track_for(&self.local_tracks, track)
    }

    /// Inbound RTP source for a remote track
    #[must_use]
    pub fn remote_track(&self, connection_id: &ConnectionId, track_id: &str) -> Option<Arc<TrackRemote>> {
        self.remote_tracks
            .get(&(connection_id.clone(), track_id.to_string()))
            .map(|entry| Arc::clone(&entry.1))
    }
}

fn sample_track_for(
    tracks: &DashMap<String, Arc<TrackLocalStaticSample>>,
    track: &LocalTrack,
) -> Arc<TrackLocalStaticSample> {
    tracks
        .entry(track.id().to_string())
        .or_insert_with(|| {
            let capability = match track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                    ..Default::default()
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
            };
            Arc::new(TrackLocalStaticSample::new(
                capability,
                track.id().to_string(),
                STREAM_ID.to_string(),
            ))
        })
        .clone()
}

#[async_trait]
impl MediaLinkFactory for WebRtcLinkFactory {
    async fn open(
        &self,
        connection_id: &ConnectionId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MediaLink>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        let keepalive = pc
            .create_data_channel(
                KEEPALIVE_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(KEEPALIVE_CHANNEL_ID),
                    ordered: Some(false),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;

        let emitter = Emitter {
            connection_id: connection_id.clone(),
            link_id,
            events,
        };
        wire_callbacks(&pc, &keepalive, &emitter, &self.remote_tracks);

        debug!(connection_id = %connection_id, link_id, "Opened WebRTC link");

        Ok(Arc::new(WebRtcLink {
            id: link_id,
            connection_id: connection_id.clone(),
            pc,
            keepalive,
            video_sender: Mutex::new(None),
            local_tracks: Arc::clone(&self.local_tracks),
            remote_tracks: Arc::clone(&self.remote_tracks),
        }))
    }
}

#[derive(Clone)]
struct Emitter {
    connection_id: ConnectionId,
    link_id: LinkId,
    events: LinkEventSender,
}

impl Emitter {
    fn emit(&self, kind: LinkEventKind) {
        // Receiver gone means the registry shut down
        let _ = self.events.send(LinkEvent {
            connection_id: self.connection_id.clone(),
            link_id: self.link_id,
            kind,
        });
    }
}

fn wire_callbacks(
    pc: &RTCPeerConnection,
    keepalive: &Arc<RTCDataChannel>,
    emitter: &Emitter,
    remote_tracks: &Arc<RemoteTrackMap<Arc<TrackRemote>>>,
) {
    let e = emitter.clone();
    let remote_tracks = Arc::clone(remote_tracks);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let remote = RemoteTrack {
                id: track.id(),
                kind: TrackKind::from(track.kind()),
                stream_id: track.stream_id(),
            };
            remote_tracks.insert((e.connection_id.clone(), remote.id.clone()), (e.link_id, track));
            e.emit(LinkEventKind::TrackAdded(remote));
            Box::pin(async {})
        },
    ));

    let e = emitter.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::Connecting => LinkConnectionState::Connecting,
            RTCPeerConnectionState::Connected => LinkConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => LinkConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => LinkConnectionState::Failed,
            RTCPeerConnectionState::Closed => LinkConnectionState::Closed,
            _ => LinkConnectionState::New,
        };
        e.emit(LinkEventKind::ConnectionState(mapped));
        Box::pin(async {})
    }));

    let e = emitter.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let mapped = match state {
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
            _ => IceConnectionState::New,
        };
        e.emit(LinkEventKind::IceState(mapped));
        Box::pin(async {})
    }));

    let e = emitter.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => e.emit(LinkEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(err) => warn!(
                    connection_id = %e.connection_id,
                    error = %err,
                    "Failed to serialize local ICE candidate"
                ),
            }
        }
        Box::pin(async {})
    }));

    let e = emitter.clone();
    keepalive.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string && msg.data.as_ref() == HEARTBEAT_PAYLOAD.as_bytes() {
            e.emit(LinkEventKind::Heartbeat);
        }
        Box::pin(async {})
    }));
}

struct WebRtcLink {
    id: LinkId,
    connection_id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    keepalive: Arc<RTCDataChannel>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    local_tracks: Arc<DashMap<String, Arc<TrackLocalStaticSample>>>,
    remote_tracks: Arc<RemoteTrackMap<Arc<TrackRemote>>>,
}

impl WebRtcLink {
    fn sample_track(&self, track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        sample_track_for(&self.local_tracks, track)
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(Error::Link("Rollback descriptions are not supported".to_string()))
        }
    };
    Ok(rtc)
}

#[async_trait]
impl MediaLink for WebRtcLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.pc.add_track(self.sample_track(track)).await?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(Arc::clone(&sender));
        }

        // Drain RTCP so interceptors keep running
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        let sender = self.video_sender.lock().clone();
        match (sender, track) {
            (Some(sender), track) => {
                sender
                    .replace_track(track.map(|t| self.sample_track(t)))
                    .await?;
            }
            (None, Some(track)) => {
                // No video m-line yet; the track rides the next negotiation
                debug!(
                    connection_id = %self.connection_id,
                    "No video sender to replace, adding track"
                );
                self.add_track(track).await?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        if self.keepalive.ready_state() != RTCDataChannelState::Open {
            trace!(connection_id = %self.connection_id, "Keepalive channel not open yet");
            return Ok(());
        }
        self.keepalive
            .send_text(HEARTBEAT_PAYLOAD.to_string())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        release_link_tracks(&self.remote_tracks, &self.connection_id, self.id);
        self.pc.close().await?;
        Ok(())
    }
}
