//! Peer connection registry: one media link per remote participant.

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use sessionlink_core::{models::ConnectionId, protocol::Signal};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RtcConfig;
use crate::events::{EventBus, SubscriptionId};
use crate::link::{LinkConnectionState, LinkEvent, LinkEventKind, LinkEventSender, LinkId, MediaLinkFactory};
use crate::media::{LocalStream, LocalTrack, MediaSource, RemoteStream, TrackKind};
use crate::negotiation::NegotiationState;
use crate::peer::{PeerConnection, PeerStatus};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    RemoteStreamAdded,
    RemoteStreamRemoved,
    StatusChanged,
    ConnectionStateChanged,
    LocalStreamChanged,
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    RemoteStreamAdded {
        connection_id: ConnectionId,
        stream: RemoteStream,
    },
    RemoteStreamRemoved {
        connection_id: ConnectionId,
    },
    StatusChanged {
        connection_id: ConnectionId,
        status: PeerStatus,
    },
    ConnectionStateChanged {
        connection_id: ConnectionId,
        state: LinkConnectionState,
    },
    /// Outgoing stream changed (capture started, screen share toggled, stopped)
    LocalStreamChanged { stream: Option<LocalStream> },
}

impl PeerEvent {
    #[must_use]
    pub const fn kind(&self) -> PeerEventKind {
        match self {
            Self::RemoteStreamAdded { .. } => PeerEventKind::RemoteStreamAdded,
            Self::RemoteStreamRemoved { .. } => PeerEventKind::RemoteStreamRemoved,
            Self::StatusChanged { .. } => PeerEventKind::StatusChanged,
            Self::ConnectionStateChanged { .. } => PeerEventKind::ConnectionStateChanged,
            Self::LocalStreamChanged { .. } => PeerEventKind::LocalStreamChanged,
        }
    }
}

/// Entry of [`PeerRegistry::all_streams`]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEntry {
    Local(LocalStream),
    Remote {
        connection_id: ConnectionId,
        stream: RemoteStream,
    },
}

/// Camera capture and screen share; at most one of them feeds the outgoing
/// video at a time.
#[derive(Default)]
pub(crate) struct LocalMedia {
    pub(crate) camera: Option<LocalStream>,
    pub(crate) screen: Option<LocalStream>,
}

impl LocalMedia {
    /// Stream shown as "local": the screen share while active, else the camera
    pub(crate) fn active_stream(&self) -> Option<LocalStream> {
        self.screen.clone().or_else(|| self.camera.clone())
    }

    /// Tracks to attach to a new link
    pub(crate) fn outgoing_tracks(&self) -> Vec<LocalTrack> {
        let mut tracks: Vec<LocalTrack> = self
            .camera
            .iter()
            .flat_map(|c| c.audio_tracks().cloned())
            .collect();

        let video = self
            .screen
            .as_ref()
            .and_then(LocalStream::video_track)
            .or_else(|| self.camera.as_ref().and_then(LocalStream::video_track));
        tracks.extend(video.cloned());
        tracks
    }
}

/// Registry of peer connections for the local participant.
///
/// Every operation re-checks the map after each await: two tasks for the
/// same connection id may interleave, and only one link per id survives.
pub struct PeerRegistry {
    pub(crate) local_id: ConnectionId,
    pub(crate) config: RtcConfig,
    factory: Arc<dyn MediaLinkFactory>,
    pub(crate) media_source: Arc<dyn MediaSource>,
    pub(crate) peers: DashMap<ConnectionId, Arc<PeerConnection>>,
    pub(crate) local_media: RwLock<LocalMedia>,
    next_link_id: AtomicU64,
    link_events: LinkEventSender,
    outbox: mpsc::UnboundedSender<Signal>,
    events: EventBus<PeerEventKind, PeerEvent>,
    pub(crate) liveness: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl PeerRegistry {
    /// Build a registry. The receiver yields signals to forward to remote
    /// peers, addressed by their connection id.
    pub fn new(
        local_id: ConnectionId,
        config: RtcConfig,
        factory: Arc<dyn MediaLinkFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Signal>) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let registry = Arc::new(Self {
            local_id,
            config,
            factory,
            media_source,
            peers: DashMap::new(),
            local_media: RwLock::new(LocalMedia::default()),
            next_link_id: AtomicU64::new(1),
            link_events: link_tx,
            outbox: outbox_tx,
            events: EventBus::new(),
            liveness: Mutex::new(None),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_link_event_pump(Arc::downgrade(&registry), link_rx, shutdown));

        (registry, outbox_rx)
    }

    #[must_use]
    pub const fn local_id(&self) -> &ConnectionId {
        &self.local_id
    }

    pub fn on<F>(&self, kind: PeerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        self.events.emit(&event.kind(), &event);
    }

    pub(crate) fn send_signal(&self, signal: Signal) {
        trace!(to = %signal.connection_id(), signal = signal.kind(), "Queueing outbound signal");
        if self.outbox.send(signal).is_err() {
            warn!("Signal outbox closed, dropping signal");
        }
    }

    /// Return the peer for `connection_id`, creating it if absent.
    ///
    /// Creation acquires local media (failure is tolerated), opens a link,
    /// attaches the outgoing tracks, starts the heartbeat and, for the
    /// initiator only, sends the first offer. An existing entry is returned
    /// as is.
    pub async fn create_or_get(
        self: &Arc<Self>,
        connection_id: &ConnectionId,
        is_initiator: bool,
    ) -> Result<Arc<PeerConnection>> {
        if let Some(peer) = self.get(connection_id) {
            return Ok(peer);
        }

        if self.local_media.read().await.camera.is_none() {
            if let Err(e) = self.start_local_stream(true, true).await {
                warn!(error = %e, "Local media unavailable, continuing receive-only");
            }
        }
        if let Some(peer) = self.get(connection_id) {
            return Ok(peer);
        }

        let link_id: LinkId = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let link = self
            .factory
            .open(connection_id, link_id, self.link_events.clone())
            .await?;

        // Attach and insert under the read lock so a screen-share swap
        // either sees this entry or happens before the attach.
        let media = self.local_media.read().await;
        if let Some(existing) = self.get(connection_id) {
            drop(media);
            close_losing_link(connection_id, &*link).await;
            return Ok(existing);
        }
        for track in media.outgoing_tracks() {
            if let Err(e) = link.add_track(&track).await {
                warn!(connection_id = %connection_id, track_id = track.id(), error = %e, "Failed to attach local track");
            }
        }

        let peer = Arc::new(PeerConnection::new(connection_id.clone(), link.clone(), is_initiator));
        let inserted = match self.peers.entry(connection_id.clone()) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&peer));
                Ok(peer)
            }
        };
        drop(media);

        let peer = match inserted {
            Ok(peer) => peer,
            Err(existing) => {
                close_losing_link(connection_id, &*link).await;
                return Ok(existing);
            }
        };

        peer.start_heartbeat(self.config.heartbeat_interval());
        self.ensure_liveness_monitor();
        info!(connection_id = %connection_id, link_id, is_initiator, "Peer connection created");

        if is_initiator {
            if let Err(e) = self.send_offer(connection_id).await {
                warn!(connection_id = %connection_id, error = %e, "Failed to send initial offer");
            }
        }

        Ok(peer)
    }

    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<PeerConnection>> {
        self.peers.get(connection_id).map(|p| Arc::clone(&p))
    }

    /// Whether `peer` is still the registered entry for its id
    pub(crate) fn is_current(&self, peer: &PeerConnection) -> bool {
        self.peers
            .get(peer.connection_id())
            .is_some_and(|p| p.link_id() == peer.link_id())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Close and remove a peer. No-op if absent.
    pub async fn close(&self, connection_id: &ConnectionId) {
        self.close_link(connection_id, None).await;
    }

    /// Close the entry only if it still holds `link_id` (when given)
    pub(crate) async fn close_link(&self, connection_id: &ConnectionId, link_id: Option<LinkId>) -> bool {
        let Some((_, peer)) = self
            .peers
            .remove_if(connection_id, |_, p| link_id.map_or(true, |id| p.link_id() == id))
        else {
            return false;
        };

        peer.stop_heartbeat();
        peer.set_negotiation_state(NegotiationState::Closed);
        peer.set_connected(false);

        if peer.has_remote_media() {
            self.emit(PeerEvent::RemoteStreamRemoved {
                connection_id: connection_id.clone(),
            });
        }
        if let Err(e) = peer.link().close().await {
            warn!(connection_id = %connection_id, error = %e, "Error closing media link");
        }
        info!(connection_id = %connection_id, "Peer connection closed");
        true
    }

    /// Close every peer, stop liveness supervision, end any screen share and
    /// release local capture.
    pub async fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.peers.iter().map(|p| p.key().clone()).collect();
        for connection_id in &ids {
            self.close(connection_id).await;
        }
        self.stop_liveness_monitor();

        if let Err(e) = self.stop_screen_share().await {
            warn!(error = %e, "Failed to stop screen share");
        }

        let released = {
            let mut media = self.local_media.write().await;
            let camera = media.camera.take();
            if let Some(screen) = media.screen.take() {
                screen.stop();
            }
            camera
        };
        if let Some(camera) = released {
            camera.stop();
            self.emit(PeerEvent::LocalStreamChanged { stream: None });
        }
        debug!(closed = ids.len(), "Closed all peer connections");
    }

    /// Peers currently classified active
    #[must_use]
    pub fn list_active(&self) -> Vec<Arc<PeerConnection>> {
        self.peers
            .iter()
            .filter(|p| p.status() == PeerStatus::Active)
            .map(|p| Arc::clone(&p))
            .collect()
    }

    /// Peers that have delivered at least one remote track
    #[must_use]
    pub fn list_with_remote_stream(&self) -> Vec<(ConnectionId, RemoteStream)> {
        self.peers
            .iter()
            .filter(|p| p.has_remote_media())
            .map(|p| (p.key().clone(), p.remote_stream()))
            .collect()
    }

    /// Local stream (if any) followed by every non-empty remote stream
    pub async fn all_streams(&self) -> Vec<StreamEntry> {
        let mut streams: Vec<StreamEntry> = self
            .local_media
            .read()
            .await
            .active_stream()
            .map(StreamEntry::Local)
            .into_iter()
            .collect();
        streams.extend(
            self.list_with_remote_stream()
                .into_iter()
                .map(|(connection_id, stream)| StreamEntry::Remote { connection_id, stream }),
        );
        streams
    }

    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.local_media.read().await.active_stream()
    }

    /// Start camera/microphone capture, reusing an existing capture
    pub async fn start_local_stream(&self, video: bool, audio: bool) -> Result<LocalStream> {
        if let Some(camera) = self.local_media.read().await.camera.clone() {
            return Ok(camera);
        }

        let stream = self.media_source.user_media(video, audio).await?;

        let mut media = self.local_media.write().await;
        if let Some(existing) = media.camera.clone() {
            stream.stop();
            return Ok(existing);
        }
        media.camera = Some(stream.clone());
        let active = media.active_stream();
        drop(media);

        info!(tracks = stream.tracks().len(), "Local media started");
        self.emit(PeerEvent::LocalStreamChanged { stream: active });
        Ok(stream)
    }

    /// Enable or mute the microphone. Returns false without local audio.
    pub async fn toggle_audio(&self, enabled: bool) -> bool {
        self.set_camera_tracks_enabled(TrackKind::Audio, enabled).await
    }

    /// Enable or blank the camera. Returns false without local video.
    pub async fn toggle_video(&self, enabled: bool) -> bool {
        self.set_camera_tracks_enabled(TrackKind::Video, enabled).await
    }

    async fn set_camera_tracks_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let media = self.local_media.read().await;
        let Some(camera) = media.camera.as_ref() else {
            return false;
        };
        let mut found = false;
        for track in camera.tracks().iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            found = true;
        }
        debug!(?kind, enabled, found, "Toggled local tracks");
        found
    }

    fn handle_link_event(&self, event: LinkEvent) {
        let Some(peer) = self.get(&event.connection_id) else {
            trace!(connection_id = %event.connection_id, "Link event for unknown peer");
            return;
        };
        if peer.link_id() != event.link_id {
            debug!(
                connection_id = %event.connection_id,
                stale_link = event.link_id,
                current_link = peer.link_id(),
                "Dropping event from superseded link"
            );
            return;
        }

        match event.kind {
            LinkEventKind::TrackAdded(track) => {
                let track_id = track.id.clone();
                let added = peer.add_remote_track(track);
                self.record_activity(&peer);
                if added {
                    debug!(connection_id = %event.connection_id, track_id = %track_id, "Remote track added");
                    self.emit(PeerEvent::RemoteStreamAdded {
                        connection_id: event.connection_id,
                        stream: peer.remote_stream(),
                    });
                }
            }
            LinkEventKind::ConnectionState(state) => {
                let connected = state == LinkConnectionState::Connected;
                peer.set_connected(connected);
                if connected {
                    peer.set_negotiation_state(NegotiationState::Connected);
                    self.record_activity(&peer);
                }
                debug!(connection_id = %event.connection_id, ?state, "Link connection state");
                self.emit(PeerEvent::ConnectionStateChanged {
                    connection_id: event.connection_id,
                    state,
                });
            }
            LinkEventKind::IceState(state) => {
                if state.is_connected() {
                    self.record_activity(&peer);
                }
            }
            LinkEventKind::Heartbeat => self.record_activity(&peer),
            LinkEventKind::LocalCandidate(candidate) => {
                self.send_signal(Signal::IceCandidate {
                    connection_id: event.connection_id,
                    candidate,
                });
            }
        }
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.stop_liveness_monitor();
        self.shutdown.cancel();
    }
}

async fn close_losing_link(connection_id: &ConnectionId, link: &dyn crate::link::MediaLink) {
    debug!(connection_id = %connection_id, link_id = link.id(), "Concurrent create won, closing duplicate link");
    if let Err(e) = link.close().await {
        warn!(connection_id = %connection_id, error = %e, "Error closing duplicate link");
    }
}

async fn run_link_event_pump(
    registry: Weak<PeerRegistry>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_link_event(event);
    }
    trace!("Link event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{RemoteTrack, StaticMediaSource};
    use crate::link::MediaLink;
    use crate::test_helpers::{registry_with, LinkCall, MockLinkFactory};
    use std::time::Duration;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn remote_track(track_id: &str) -> RemoteTrack {
        RemoteTrack {
            id: track_id.to_string(),
            kind: TrackKind::Video,
            stream_id: "remote-stream".to_string(),
        }
    }

    fn collect(registry: &PeerRegistry, kind: PeerEventKind) -> Arc<Mutex<Vec<PeerEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.on(kind, move |event| sink.lock().push(event.clone()));
        seen
    }

    #[tokio::test]
    async fn test_create_or_get_attaches_local_tracks_once() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());

        let first = registry.create_or_get(&id("remote"), false).await.unwrap();
        let second = registry.create_or_get(&id("remote"), true).await.unwrap();

        assert_eq!(first.link_id(), second.link_id());
        assert!(!second.is_initiator());
        assert_eq!(factory.opened(), 1);

        let link = factory.latest(&id("remote")).unwrap();
        assert_eq!(link.count(|c| matches!(c, LinkCall::AddTrack(_))), 2);
        assert!(registry.local_stream().await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_creates_keep_one_link() {
        let (registry, factory, _outbox) = registry_with(
            MockLinkFactory::new().with_open_delay(Duration::from_millis(20)),
            StaticMediaSource::default(),
        );

        let (remote_a, remote_b) = (id("remote"), id("remote"));
        let (a, b) = tokio::join!(
            registry.create_or_get(&remote_a, false),
            registry.create_or_get(&remote_b, false)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.link_id(), b.link_id());
        assert_eq!(registry.len(), 1);
        let links = factory.links_for(&id("remote"));
        let open: Vec<_> = links.iter().filter(|l| !l.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), a.link_id());
    }

    #[tokio::test]
    async fn test_receive_only_without_devices() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::none());

        registry.create_or_get(&id("remote"), false).await.unwrap();

        assert!(registry.local_stream().await.is_none());
        let link = factory.latest(&id("remote")).unwrap();
        assert_eq!(link.count(|c| matches!(c, LinkCall::AddTrack(_))), 0);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_entry() {
        let factory = MockLinkFactory::new();
        factory.set_fail_open(true);
        let (registry, _factory, _outbox) = registry_with(factory, StaticMediaSource::default());

        assert!(registry.create_or_get(&id("remote"), true).await.is_err());
        assert!(registry.get(&id("remote")).is_none());
    }

    #[tokio::test]
    async fn test_remote_track_and_close_events() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
        let added = collect(&registry, PeerEventKind::RemoteStreamAdded);
        let removed = collect(&registry, PeerEventKind::RemoteStreamRemoved);

        registry.create_or_get(&id("remote"), false).await.unwrap();
        let link = factory.latest(&id("remote")).unwrap();
        link.emit(LinkEventKind::TrackAdded(remote_track("t1")));
        link.emit(LinkEventKind::TrackAdded(remote_track("t1")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(added.lock().len(), 1);
        let streams = registry.all_streams().await;
        assert_eq!(streams.len(), 2);
        assert!(matches!(streams[0], StreamEntry::Local(_)));
        assert!(matches!(&streams[1], StreamEntry::Remote { connection_id, .. } if *connection_id == id("remote")));

        registry.close(&id("remote")).await;
        registry.close(&id("remote")).await;

        assert!(link.is_closed());
        assert_eq!(
            *removed.lock(),
            vec![PeerEvent::RemoteStreamRemoved {
                connection_id: id("remote")
            }]
        );
        assert_eq!(registry.all_streams().await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_from_superseded_link_are_ignored() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
        let added = collect(&registry, PeerEventKind::RemoteStreamAdded);

        registry.create_or_get(&id("remote"), false).await.unwrap();
        let old = factory.latest(&id("remote")).unwrap();
        registry.close(&id("remote")).await;
        registry.create_or_get(&id("remote"), false).await.unwrap();

        old.emit(LinkEventKind::TrackAdded(remote_track("late")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(added.lock().is_empty());
        assert!(!registry.get(&id("remote")).unwrap().has_remote_media());
    }

    #[tokio::test]
    async fn test_connected_state_updates_peer() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
        let changes = collect(&registry, PeerEventKind::ConnectionStateChanged);

        let peer = registry.create_or_get(&id("remote"), false).await.unwrap();
        factory
            .latest(&id("remote"))
            .unwrap()
            .emit(LinkEventKind::ConnectionState(LinkConnectionState::Connected));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(peer.is_connected());
        assert_eq!(peer.negotiation_state(), NegotiationState::Connected);
        assert_eq!(changes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_toggles_follow_available_tracks() {
        let (registry, _factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
        assert!(!registry.toggle_audio(false).await);

        let stream = registry.start_local_stream(true, true).await.unwrap();
        assert!(registry.toggle_audio(false).await);
        assert!(!stream.audio_tracks().next().unwrap().is_enabled());
        assert!(registry.toggle_video(false).await);
        assert!(registry.toggle_video(true).await);
        assert!(stream.video_track().unwrap().is_enabled());

        // A second start reuses the capture
        let again = registry.start_local_stream(true, true).await.unwrap();
        assert_eq!(again.id(), stream.id());
    }

    #[tokio::test]
    async fn test_close_all_releases_everything() {
        let (registry, factory, _outbox) = registry_with(MockLinkFactory::new(), StaticMediaSource::default());
        let local = collect(&registry, PeerEventKind::LocalStreamChanged);

        registry.create_or_get(&id("b"), false).await.unwrap();
        registry.create_or_get(&id("c"), false).await.unwrap();
        let camera = registry.local_stream().await.unwrap();
        registry.start_screen_share().await.unwrap();

        registry.close_all().await;

        assert!(registry.is_empty());
        assert!(factory.latest(&id("b")).unwrap().is_closed());
        assert!(factory.latest(&id("c")).unwrap().is_closed());
        assert!(camera.tracks().iter().all(LocalTrack::is_stopped));
        assert!(registry.local_stream().await.is_none());
        assert_eq!(
            local.lock().last(),
            Some(&PeerEvent::LocalStreamChanged { stream: None })
        );
    }
}
