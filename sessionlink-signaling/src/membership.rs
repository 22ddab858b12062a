use dashmap::DashMap;
use indexmap::IndexSet;
use serde_json::Value;
use sessionlink_core::{
    models::{normalize_connections, CallId, ConnectionId, VideoCall},
    protocol::{
        CallBroadcast, CallMessage, JoinResult, ParticipantEvent, ParticipantUpdate, ServerEvent,
        Signal,
    },
    repository::CallStore,
    Error, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::hub::{BroadcastOutcome, ConnectionHub};

/// Message types with membership semantics inside `videoCall.message`
const MESSAGE_SIGNAL: &str = "signal";
const MESSAGE_JOIN: &str = "join";
const MESSAGE_LEAVE: &str = "leave";

/// What a relayed message ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Signal delivered to its target
    Delivered,
    /// Fanned out to some or all members
    Broadcast { recipients: usize },
    Joined(JoinResult),
    Left,
}

enum SyncDecision {
    WriteNow,
    Defer(Instant),
    Skip,
}

#[derive(Debug, Clone, Copy)]
struct SyncState {
    last_sync: Option<Instant>,
    flush_pending: bool,
}

/// Per-call membership cache reconciled with storage.
///
/// Memory is authoritative for routing. Storage receives the full set on
/// joins (at most once per throttle window, with a trailing write for joins
/// that fall inside the window) and targeted removals on leaves and prunes.
/// Handlers for the same call may interleave; every set operation is
/// idempotent. Storage writes for one call are serialized, and a full-set
/// write snapshots memory only once it holds the call's write lock, so a
/// removal can never be overwritten by an older snapshot.
#[derive(Clone)]
pub struct CallMembershipCoordinator {
    store: Arc<dyn CallStore>,
    hub: ConnectionHub,
    members: Arc<DashMap<CallId, IndexSet<ConnectionId>>>,
    sync: Arc<DashMap<CallId, SyncState>>,
    write_locks: Arc<DashMap<CallId, Arc<Mutex<()>>>>,
    sync_throttle: Duration,
}

impl CallMembershipCoordinator {
    pub fn new(store: Arc<dyn CallStore>, hub: ConnectionHub, sync_throttle: Duration) -> Self {
        Self {
            store,
            hub,
            members: Arc::new(DashMap::new()),
            sync: Arc::new(DashMap::new()),
            write_locks: Arc::new(DashMap::new()),
            sync_throttle,
        }
    }

    #[must_use]
    pub const fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Persist a new call
    pub async fn create(
        &self,
        creator: Option<String>,
        connections: Vec<ConnectionId>,
    ) -> Result<VideoCall> {
        let call = self.store.create(&VideoCall::new(creator, connections)).await?;
        info!(call_id = %call.id, connections = call.connections.len(), "Video call created");
        Ok(call)
    }

    /// Fetch a persisted call. When `connection_id` is given it is recorded in
    /// the persisted membership list.
    pub async fn get(&self, call_id: &CallId, connection_id: Option<&ConnectionId>) -> Result<VideoCall> {
        let mut call = self.load_call(call_id).await?;

        if let Some(connection_id) = connection_id.filter(|c| !c.is_blank()) {
            if !call.has_connection(connection_id) {
                call.connections.push(connection_id.clone());
                let lock = self.write_lock(call_id);
                let _guard = lock.lock().await;
                self.store.replace_connections(call_id, &call.connections).await?;
            }
        }
        Ok(call)
    }

    /// Snapshot of the in-memory membership
    #[must_use]
    pub fn active_connections(&self, call_id: &CallId) -> Vec<ConnectionId> {
        self.members
            .get(call_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls with an in-memory membership entry
    #[must_use]
    pub fn resident_calls(&self) -> usize {
        self.members.len()
    }

    pub async fn join(&self, call_id: &CallId, connection_id: &ConnectionId) -> Result<JoinResult> {
        if connection_id.is_blank() {
            return Err(Error::InvalidInput("connectionId is required".to_string()));
        }
        let mut call = self.load_call(call_id).await?;
        self.ensure_resident(&call);

        let active = {
            let mut set = self.members.entry(call_id.clone()).or_default();
            set.insert(connection_id.clone());
            set.iter().cloned().collect::<Vec<_>>()
        };
        info!(
            call_id = %call_id,
            connection_id = %connection_id,
            total = active.len(),
            "Participant joined"
        );

        self.sync_throttled(call_id).await;

        let joined = ServerEvent::VideoCallParticipant(ParticipantUpdate {
            event: ParticipantEvent::Joined,
            connection_id: connection_id.clone(),
            total_participants: active.len(),
        });
        let outcome = self.hub.broadcast(&active, &joined);
        self.prune(call_id, &outcome).await;

        let others: Vec<ConnectionId> = self
            .active_connections(call_id)
            .into_iter()
            .filter(|c| c != connection_id)
            .collect();
        let announce = ServerEvent::VideoCallSignal(Signal::NewParticipant {
            connection_id: connection_id.clone(),
        });
        let outcome = self.hub.broadcast(&others, &announce);
        self.prune(call_id, &outcome).await;

        let active_connections = self.active_connections(call_id);
        call.connections.clone_from(&active_connections);
        Ok(JoinResult {
            video_call: call,
            active_connections,
        })
    }

    pub async fn leave(&self, call_id: &CallId, connection_id: &ConnectionId) -> Result<()> {
        let call = self.load_call(call_id).await?;
        self.ensure_resident(&call);

        let remaining = match self.members.get_mut(call_id) {
            Some(mut set) => {
                set.shift_remove(connection_id);
                set.iter().cloned().collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        {
            let lock = self.write_lock(call_id);
            let _guard = lock.lock().await;
            self.store
                .remove_connections(call_id, std::slice::from_ref(connection_id))
                .await?;
        }
        if remaining.is_empty() {
            self.evict_if_empty(call_id);
        }
        info!(
            call_id = %call_id,
            connection_id = %connection_id,
            remaining = remaining.len(),
            "Participant left"
        );

        let left = ServerEvent::VideoCallParticipant(ParticipantUpdate {
            event: ParticipantEvent::Left,
            connection_id: connection_id.clone(),
            total_participants: remaining.len(),
        });
        let outcome = self.hub.broadcast(&remaining, &left);
        self.prune(call_id, &outcome).await;

        let signal = ServerEvent::VideoCallSignal(Signal::ParticipantLeft {
            connection_id: connection_id.clone(),
        });
        let remaining = self.active_connections(call_id);
        let outcome = self.hub.broadcast(&remaining, &signal);
        self.prune(call_id, &outcome).await;

        Ok(())
    }

    /// Route a `videoCall.message` envelope from `sender`
    pub async fn relay_message(
        &self,
        call_id: &CallId,
        sender: &ConnectionId,
        kind: &str,
        data: Value,
    ) -> Result<RelayOutcome> {
        match kind {
            MESSAGE_JOIN => return self.join(call_id, sender).await.map(RelayOutcome::Joined),
            MESSAGE_LEAVE => return self.leave(call_id, sender).await.map(|()| RelayOutcome::Left),
            _ => {}
        }

        let call = self.load_call(call_id).await?;
        self.ensure_resident(&call);
        let members = self.active_connections(call_id);

        if kind == MESSAGE_SIGNAL {
            let signal: Signal = serde_json::from_value(data)
                .map_err(|e| Error::InvalidInput(format!("Invalid signal payload: {e}")))?;
            return Ok(self.relay_signal(call_id, &members, sender, signal).await);
        }

        let event = ServerEvent::VideoCall(CallBroadcast {
            id: call_id.clone(),
            message: CallMessage {
                kind: kind.to_string(),
                data,
            },
        });
        let outcome = self.hub.broadcast(&members, &event);
        let recipients = outcome.successful.len();
        self.prune(call_id, &outcome).await;
        Ok(RelayOutcome::Broadcast { recipients })
    }

    async fn relay_signal(
        &self,
        call_id: &CallId,
        members: &[ConnectionId],
        sender: &ConnectionId,
        signal: Signal,
    ) -> RelayOutcome {
        let target = signal.connection_id().clone();
        let kind = signal.kind();
        let event = ServerEvent::VideoCallSignal(signal.with_connection_id(sender.clone()));

        if &target != sender && members.contains(&target) {
            let outcome = self.hub.broadcast([&target], &event);
            let delivered = !outcome.successful.is_empty();
            self.prune(call_id, &outcome).await;
            debug!(
                call_id = %call_id,
                from = %sender,
                to = %target,
                signal = kind,
                delivered,
                "Signal relayed"
            );
            return RelayOutcome::Delivered;
        }

        let others = members.iter().filter(|c| *c != sender);
        let outcome = self.hub.broadcast(others, &event);
        let recipients = outcome.successful.len();
        self.prune(call_id, &outcome).await;
        debug!(
            call_id = %call_id,
            from = %sender,
            signal = kind,
            recipients,
            "Untargeted signal broadcast"
        );
        RelayOutcome::Broadcast { recipients }
    }

    async fn load_call(&self, call_id: &CallId) -> Result<VideoCall> {
        self.store
            .get(call_id)
            .await?
            .ok_or_else(|| Error::NotFound("Video call not found".to_string()))
    }

    /// Seed the cache from storage when the call has no in-memory entry
    fn ensure_resident(&self, call: &VideoCall) {
        self.members.entry(call.id.clone()).or_insert_with(|| {
            debug!(call_id = %call.id, persisted = call.connections.len(), "Loading membership from storage");
            normalize_connections(call.connections.iter().cloned())
        });
    }

    /// Drop unreachable recipients from memory and, best effort, from storage
    async fn prune(&self, call_id: &CallId, outcome: &BroadcastOutcome) {
        if outcome.invalid.is_empty() {
            return;
        }

        let emptied = match self.members.get_mut(call_id) {
            Some(mut set) => {
                set.retain(|c| !outcome.invalid.contains(c));
                set.is_empty()
            }
            None => false,
        };
        warn!(
            call_id = %call_id,
            pruned = ?outcome.invalid,
            "Pruned unreachable participants"
        );

        {
            let lock = self.write_lock(call_id);
            let _guard = lock.lock().await;
            if let Err(err) = self.store.remove_connections(call_id, &outcome.invalid).await {
                warn!(call_id = %call_id, error = %err, "Failed to prune persisted participants");
            }
        }
        if emptied {
            self.evict_if_empty(call_id);
        }
    }

    /// Forget a call with no members left. A pending trailing write keeps its
    /// sync state and a held write lock keeps its entry.
    fn evict_if_empty(&self, call_id: &CallId) {
        if self.members.remove_if(call_id, |_, set| set.is_empty()).is_none() {
            return;
        }
        self.sync.remove_if(call_id, |_, state| !state.flush_pending);
        self.write_locks.remove_if(call_id, |_, lock| Arc::strong_count(lock) == 1);
        debug!(call_id = %call_id, "Evicted empty call from membership cache");
    }

    fn write_lock(&self, call_id: &CallId) -> Arc<Mutex<()>> {
        Arc::clone(&self.write_locks.entry(call_id.clone()).or_default())
    }

    /// Persist the full set unless a write happened inside the throttle
    /// window, in which case a single trailing write is scheduled.
    async fn sync_throttled(&self, call_id: &CallId) {
        let now = Instant::now();
        let decision = {
            let mut state = self.sync.entry(call_id.clone()).or_insert(SyncState {
                last_sync: None,
                flush_pending: false,
            });
            match state.last_sync {
                Some(last) if now.saturating_duration_since(last) < self.sync_throttle => {
                    if state.flush_pending {
                        SyncDecision::Skip
                    } else {
                        state.flush_pending = true;
                        SyncDecision::Defer(last + self.sync_throttle)
                    }
                }
                _ => {
                    state.last_sync = Some(now);
                    SyncDecision::WriteNow
                }
            }
        };

        match decision {
            SyncDecision::WriteNow => self.write_members(call_id).await,
            SyncDecision::Defer(at) => {
                let this = self.clone();
                let call_id = call_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep_until(at).await;
                    if let Some(mut state) = this.sync.get_mut(&call_id) {
                        state.flush_pending = false;
                        state.last_sync = Some(Instant::now());
                    }
                    this.write_members(&call_id).await;
                });
            }
            SyncDecision::Skip => {}
        }
    }

    async fn write_members(&self, call_id: &CallId) {
        let lock = self.write_lock(call_id);
        let _guard = lock.lock().await;
        let connections = self.active_connections(call_id);
        if let Err(err) = self.store.replace_connections(call_id, &connections).await {
            warn!(call_id = %call_id, error = %err, "Failed to sync participants to storage");
        }
    }
}
