//! Local and remote media model.
//!
//! Tracks carry shared enable/stop flags so every clone observes the same
//! state; the link backend reads them when deciding whether to send samples.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sessionlink_core::models::generate_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for TrackKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Capture device a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            id: generate_id(),
            kind,
            source,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub const fn source(&self) -> TrackSource {
        self.source
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Camera/microphone capture or a screen share
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    #[must_use]
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: generate_id(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    #[must_use]
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.video_tracks().next()
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Inbound track announced by a media link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Tracks received from one remote participant. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Returns false when a track with the same id is already present
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }
}

/// Capture device access
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream>;

    async fn display_media(&self) -> Result<LocalStream>;
}

/// Media source backed by fixed device availability. Tracks it hands out
/// are fed by whatever writes samples into the matching link tracks.
#[derive(Debug, Clone, Copy)]
pub struct StaticMediaSource {
    pub camera: bool,
    pub microphone: bool,
    pub screen: bool,
}

impl Default for StaticMediaSource {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            screen: true,
        }
    }
}

impl StaticMediaSource {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            camera: false,
            microphone: false,
            screen: false,
        }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn user_media(&self, video: bool, audio: bool) -> Result<LocalStream> {
        if (video && !self.camera) || (audio && !self.microphone) {
            return Err(Error::MediaUnavailable(format!(
                "Requested video={video} audio={audio}, available camera={} microphone={}",
                self.camera, self.microphone
            )));
        }
        if !video && !audio {
            return Err(Error::MediaUnavailable("No media kinds requested".to_string()));
        }

        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, TrackSource::Microphone));
        }
        if video {
            tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Camera));
        }
        Ok(LocalStream::new(tracks))
    }

    async fn display_media(&self) -> Result<LocalStream> {
        if !self.screen {
            return Err(Error::MediaUnavailable("Screen capture not available".to_string()));
        }
        Ok(LocalStream::new(vec![LocalTrack::new(
            TrackKind::Video,
            TrackSource::Screen,
        )]))
    }
}
