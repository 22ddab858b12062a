//! In-memory media links for exercising the peer registry without a network.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sessionlink_core::{
    models::ConnectionId,
    protocol::{IceCandidate, SessionDescription, Signal},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::RtcConfig;
use crate::link::{LinkEvent, LinkEventKind, LinkEventSender, LinkId, MediaLink, MediaLinkFactory};
use crate::media::{LocalTrack, MediaSource};
use crate::registry::PeerRegistry;
use crate::{Error, Result};

/// Operation recorded by [`MockLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetRemote(SessionDescription),
    AddIce(IceCandidate),
    ReplaceVideo(Option<String>),
    Heartbeat,
    Close,
}

pub struct MockLink {
    id: LinkId,
    connection_id: ConnectionId,
    events: LinkEventSender,
    calls: Mutex<Vec<LinkCall>>,
    closed: AtomicBool,
}

impl MockLink {
    #[must_use]
    pub fn new(connection_id: ConnectionId, id: LinkId, events: LinkEventSender) -> Self {
        Self {
            id,
            connection_id,
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&LinkCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Inject an event as if the media stack raised it
    pub fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            connection_id: self.connection_id.clone(),
            link_id: self.id,
            kind,
        });
    }

    fn record(&self, call: LinkCall) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Link("link closed".to_string()));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl MediaLink for MockLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(LinkCall::AddTrack(track.id().to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(LinkCall::CreateOffer)?;
        Ok(SessionDescription::offer(format!("offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(LinkCall::CreateAnswer)?;
        Ok(SessionDescription::answer(format!("answer-{}", self.id)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(LinkCall::SetRemote(description))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(LinkCall::AddIce(candidate))
    }

    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> Result<()> {
        self.record(LinkCall::ReplaceVideo(track.map(|t| t.id().to_string())))
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.record(LinkCall::Heartbeat)
    }

    async fn close(&self) -> Result<()> {
        self.calls.lock().push(LinkCall::Close);
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory handing out [`MockLink`]s; clones share the created links
#[derive(Clone, Default)]
pub struct MockLinkFactory {
    links: Arc<DashMap<ConnectionId, Vec<Arc<MockLink>>>>,
    open_delay: Option<Duration>,
    fail_open: Arc<AtomicBool>,
}

impl MockLinkFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `open` so concurrent creates interleave
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    /// Every link opened for `connection_id`, oldest first
    #[must_use]
    pub fn links_for(&self, connection_id: &ConnectionId) -> Vec<Arc<MockLink>> {
        self.links
            .get(connection_id)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn latest(&self, connection_id: &ConnectionId) -> Option<Arc<MockLink>> {
        self.links_for(connection_id).pop()
    }

    #[must_use]
    pub fn opened(&self) -> usize {
        self.links.iter().map(|l| l.len()).sum()
    }
}

#[async_trait]
impl MediaLinkFactory for MockLinkFactory {
    async fn open(
        &self,
        connection_id: &ConnectionId,
        link_id: LinkId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MediaLink>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_open.load(Ordering::Acquire) {
            return Err(Error::Link("open refused".to_string()));
        }
        let link = Arc::new(MockLink::new(connection_id.clone(), link_id, events));
        self.links
            .entry(connection_id.clone())
            .or_default()
            .push(Arc::clone(&link));
        Ok(link)
    }
}

/// Registry backed by `factory` with default settings and local id `local`
pub fn registry_with<S>(
    factory: MockLinkFactory,
    source: S,
) -> (Arc<PeerRegistry>, MockLinkFactory, mpsc::UnboundedReceiver<Signal>)
where
    S: MediaSource + 'static,
{
    registry_with_config(RtcConfig::default(), factory, source)
}

pub fn registry_with_config<S>(
    config: RtcConfig,
    factory: MockLinkFactory,
    source: S,
) -> (Arc<PeerRegistry>, MockLinkFactory, mpsc::UnboundedReceiver<Signal>)
where
    S: MediaSource + 'static,
{
    let (registry, outbox) = PeerRegistry::new(
        ConnectionId::from("local"),
        config,
        Arc::new(factory.clone()),
        Arc::new(source),
    );
    (registry, factory, outbox)
}
