//! Shell sessions shared through the relay's shell log.
//!
//! The owning peer records `spawn` and `info` events locally and queues them
//! for the shell stream. Acknowledgement lives on the session and its output
//! records, not on the queue:
//!
//! ```text
//! queue:   [Spawn S1] [Info S1#0] [Info S1#1]
//! acked:       ✓          ✓           ✗
//!          └──── trimmed ────┘    └─ next push starts here
//! ```
//!
//! A record is acknowledged when a push carrying it succeeds or when the
//! relay log echoes it back on a pull, so a push whose reply was lost is
//! never sent twice once the echo has been seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::error::SyncError;
use crate::protocol::{PeerId, RelayRequest, RelayResponse, ShellUpdate};
use crate::stream::{Pulled, StreamEndpoint};
use crate::transport::Relay;

/// A queued outbound shell event.
pub type PendingShellUpdate = ShellUpdate;

/// One chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputRecord {
    pub data: String,
    pub acknowledged: bool,
}

/// A shell session and its output log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSession {
    pub id: Uuid,
    /// `None` until the session's `spawn` event has been seen.
    pub owner: Option<PeerId>,
    /// Whether the relay has the `spawn` event.
    pub registered: bool,
    pub output: Vec<OutputRecord>,
}

impl ShellSession {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            owner: None,
            registered: false,
            output: Vec::new(),
        }
    }

    /// Output concatenated in index order.
    pub fn text(&self) -> String {
        self.output.iter().map(|r| r.data.as_str()).collect()
    }
}

/// Registry change, for viewers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Spawned { uuid: Uuid, owner: PeerId },
    Output { uuid: Uuid, index: usize, data: String },
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<Uuid, ShellSession>,
    /// Session ids in first-seen order
    order: Vec<Uuid>,
    queue: VecDeque<PendingShellUpdate>,
    shell_version: u64,
}

impl Registry {
    fn session_mut(&mut self, uuid: Uuid) -> &mut ShellSession {
        if !self.sessions.contains_key(&uuid) {
            self.order.push(uuid);
        }
        self.sessions.entry(uuid).or_insert_with(|| ShellSession::new(uuid))
    }

    fn is_acknowledged(&self, item: &PendingShellUpdate) -> bool {
        match item {
            ShellUpdate::Spawn { uuid, .. } => {
                self.sessions.get(uuid).is_some_and(|s| s.registered)
            }
            ShellUpdate::Info { uuid, index, .. } => self
                .sessions
                .get(uuid)
                .and_then(|s| s.output.get(*index))
                .is_some_and(|r| r.acknowledged),
        }
    }

    fn mark_acknowledged(&mut self, item: &PendingShellUpdate) {
        let Some(session) = self.sessions.get_mut(&item.session_id()) else {
            return;
        };
        match item {
            ShellUpdate::Spawn { .. } => session.registered = true,
            ShellUpdate::Info { index, .. } => {
                if let Some(record) = session.output.get_mut(*index) {
                    record.acknowledged = true;
                }
            }
        }
    }

    /// Drop the acknowledged prefix of the queue.
    fn trim(&mut self) {
        while let Some(front) = self.queue.front() {
            if !self.is_acknowledged(front) {
                break;
            }
            self.queue.pop_front();
        }
    }
}

/// All shell sessions known to this peer.
pub struct ShellRegistry {
    inner: Mutex<Registry>,
    local_changes: Notify,
    events: broadcast::Sender<ShellEvent>,
}

impl ShellRegistry {
    pub fn new() -> Self {
        Self::with_event_capacity(256)
    }

    /// Subscribers lagging more than `event_capacity` events miss the oldest.
    pub fn with_event_capacity(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(Registry::default()),
            local_changes: Notify::new(),
            events,
        }
    }

    /// Register a session owned by `owner` and queue its `spawn` event.
    pub fn spawn(&self, uuid: Uuid, owner: PeerId) {
        {
            let mut registry = self.inner.lock();
            let session = registry.session_mut(uuid);
            if session.registered && session.owner == Some(owner) {
                return;
            }
            session.owner = Some(owner);
            session.registered = false;
            registry.queue.push_back(ShellUpdate::Spawn { uuid, spawner: owner });
        }
        log::info!("Shell {uuid} spawned by {owner}");
        let _ = self.events.send(ShellEvent::Spawned { uuid, owner });
        self.local_changes.notify_one();
    }

    /// Append output to a session and queue its `info` event. Returns the
    /// record's index.
    pub fn append_output(&self, uuid: Uuid, data: impl Into<String>) -> Result<usize, SyncError> {
        let data = data.into();
        let index = {
            let mut registry = self.inner.lock();
            let session = registry
                .sessions
                .get_mut(&uuid)
                .ok_or(SyncError::UnknownShell(uuid))?;
            let index = session.output.len();
            session.output.push(OutputRecord {
                data: data.clone(),
                acknowledged: false,
            });
            registry.queue.push_back(ShellUpdate::Info {
                uuid,
                index,
                data: data.clone(),
            });
            index
        };
        let _ = self.events.send(ShellEvent::Output { uuid, index, data });
        self.local_changes.notify_one();
        Ok(index)
    }

    pub fn owner_of(&self, uuid: Uuid) -> Option<PeerId> {
        self.inner.lock().sessions.get(&uuid).and_then(|s| s.owner)
    }

    /// Output chunks of `uuid`, in index order.
    pub fn output(&self, uuid: Uuid) -> Option<Vec<String>> {
        self.inner
            .lock()
            .sessions
            .get(&uuid)
            .map(|s| s.output.iter().map(|r| r.data.clone()).collect())
    }

    pub fn session(&self, uuid: Uuid) -> Option<ShellSession> {
        self.inner.lock().sessions.get(&uuid).cloned()
    }

    /// Every known session, in first-seen order.
    pub fn sessions(&self) -> Vec<ShellSession> {
        let registry = self.inner.lock();
        registry
            .order
            .iter()
            .filter_map(|uuid| registry.sessions.get(uuid).cloned())
            .collect()
    }

    /// Queued events the relay has not acknowledged yet, in queue order.
    pub fn pending_updates(&self) -> Vec<PendingShellUpdate> {
        let registry = self.inner.lock();
        registry
            .queue
            .iter()
            .filter(|item| !registry.is_acknowledged(item))
            .cloned()
            .collect()
    }

    /// Mark `sent` as received by the relay and trim the queue.
    pub fn acknowledge(&self, sent: &[PendingShellUpdate]) {
        let mut registry = self.inner.lock();
        for item in sent {
            registry.mark_acknowledged(item);
        }
        registry.trim();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of shell events consumed from the relay.
    pub fn shell_version(&self) -> u64 {
        self.inner.lock().shell_version
    }

    /// Merge events pulled from the relay log.
    ///
    /// `info` may arrive for an index past the end of the log; the gap is
    /// padded with empty, unacknowledged placeholders.
    pub fn apply_remote(&self, updates: Vec<ShellUpdate>) {
        let mut events = Vec::new();
        {
            let mut registry = self.inner.lock();
            registry.shell_version += updates.len() as u64;
            for update in updates {
                match update {
                    ShellUpdate::Spawn { uuid, spawner } => {
                        let session = registry.session_mut(uuid);
                        let changed = session.owner != Some(spawner);
                        session.owner = Some(spawner);
                        session.registered = true;
                        if changed {
                            events.push(ShellEvent::Spawned { uuid, owner: spawner });
                        }
                    }
                    ShellUpdate::Info { uuid, index, data } => {
                        let session = registry.session_mut(uuid);
                        if session.output.len() <= index {
                            session.output.resize(index + 1, OutputRecord::default());
                        }
                        let record = &mut session.output[index];
                        let changed = record.data != data;
                        record.acknowledged = true;
                        if changed {
                            record.data = data.clone();
                            events.push(ShellEvent::Output { uuid, index, data });
                        }
                    }
                }
            }
            registry.trim();
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Resolves after the next local spawn or append.
    pub async fn changed(&self) {
        self.local_changes.notified().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.events.subscribe()
    }
}

impl Default for ShellRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds a [`ShellRegistry`] to the relay's shell log.
pub struct ShellEndpoint {
    registry: Arc<ShellRegistry>,
    relay: Arc<dyn Relay>,
    doc_name: String,
}

impl ShellEndpoint {
    pub fn new(registry: Arc<ShellRegistry>, relay: Arc<dyn Relay>, doc_name: impl Into<String>) -> Self {
        Self {
            registry,
            relay,
            doc_name: doc_name.into(),
        }
    }

    pub fn registry(&self) -> &Arc<ShellRegistry> {
        &self.registry
    }
}

impl StreamEndpoint for ShellEndpoint {
    type Item = PendingShellUpdate;

    fn name(&self) -> &'static str {
        "shell"
    }

    fn synced_version(&self) -> u64 {
        self.registry.shell_version()
    }

    fn pending_items(&self) -> Vec<PendingShellUpdate> {
        self.registry.pending_updates()
    }

    fn push_remote(&self, version: u64, items: Vec<PendingShellUpdate>) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let request = RelayRequest::PushShellUpdates {
                doc_name: self.doc_name.clone(),
                shell_version: version,
                shell_updates: items.clone(),
            };
            match self.relay.call(request).await {
                Ok(RelayResponse::Pushed(true)) => {
                    self.registry.acknowledge(&items);
                    true
                }
                Ok(RelayResponse::Pushed(false)) => false,
                Ok(other) => {
                    log::warn!("Unexpected reply to pushShellUpdates: {other:?}");
                    false
                }
                Err(e) => {
                    log::debug!("pushShellUpdates not applied: {e}");
                    false
                }
            }
        })
    }

    fn pull_remote(&self, version: u64) -> BoxFuture<'_, Option<Pulled<PendingShellUpdate>>> {
        Box::pin(async move {
            let request = RelayRequest::PullUpdates {
                doc_name: self.doc_name.clone(),
                version: None,
                shell_version: Some(version),
            };
            match self.relay.call(request).await {
                Ok(RelayResponse::Pulled { shell_updates, shell_version, .. }) => Some(Pulled {
                    items: shell_updates,
                    last_version: shell_version,
                }),
                Ok(other) => {
                    log::warn!("Unexpected reply to pullUpdates: {other:?}");
                    None
                }
                Err(e) => {
                    log::debug!("pullUpdates (shell) not applied: {e}");
                    None
                }
            }
        })
    }

    fn apply_local(&self, pulled: Pulled<PendingShellUpdate>) -> Result<(), SyncError> {
        self.registry.apply_remote(pulled.items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RetryScheduler;
    use crate::stream::{PullOutcome, PushOutcome, VersionedStream};
    use crate::transport::MemoryHub;

    fn info(uuid: Uuid, index: usize, data: &str) -> ShellUpdate {
        ShellUpdate::Info {
            uuid,
            index,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_spawn_and_append_queue_events() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        registry.spawn(uuid, owner);
        assert_eq!(registry.append_output(uuid, "hello\n").unwrap(), 0);
        assert_eq!(registry.append_output(uuid, "world\n").unwrap(), 1);

        assert_eq!(
            registry.pending_updates(),
            vec![
                ShellUpdate::Spawn { uuid, spawner: owner },
                info(uuid, 0, "hello\n"),
                info(uuid, 1, "world\n"),
            ]
        );
        assert_eq!(registry.owner_of(uuid), Some(owner));
        assert_eq!(registry.session(uuid).unwrap().text(), "hello\nworld\n");
    }

    #[test]
    fn test_append_to_unknown_session() {
        let registry = ShellRegistry::new();
        let uuid = Uuid::new_v4();
        assert!(matches!(
            registry.append_output(uuid, "x"),
            Err(SyncError::UnknownShell(id)) if id == uuid
        ));
        assert_eq!(registry.queue_len(), 0);
    }

    #[test]
    fn test_acknowledge_trims_prefix_only() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        registry.spawn(uuid, owner);
        registry.append_output(uuid, "a").unwrap();
        registry.append_output(uuid, "b").unwrap();

        // Only the second info confirmed: nothing can be trimmed yet
        registry.acknowledge(&[info(uuid, 1, "b")]);
        assert_eq!(registry.queue_len(), 3);
        assert_eq!(
            registry.pending_updates(),
            vec![ShellUpdate::Spawn { uuid, spawner: owner }, info(uuid, 0, "a")]
        );

        registry.acknowledge(&[ShellUpdate::Spawn { uuid, spawner: owner }, info(uuid, 0, "a")]);
        assert_eq!(registry.queue_len(), 0);
        assert!(registry.pending_updates().is_empty());
    }

    #[test]
    fn test_out_of_order_info_is_padded() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        registry.apply_remote(vec![ShellUpdate::Spawn { uuid, spawner: owner }]);

        registry.apply_remote(vec![info(uuid, 2, "data2")]);
        let padded = registry.session(uuid).unwrap();
        assert_eq!(padded.output.len(), 3);
        assert!(!padded.output[0].acknowledged);
        assert_eq!(padded.output[0].data, "");

        registry.apply_remote(vec![info(uuid, 0, "data0"), info(uuid, 1, "data1")]);
        assert_eq!(
            registry.output(uuid).unwrap(),
            vec!["data0".to_string(), "data1".to_string(), "data2".to_string()]
        );
        assert_eq!(registry.shell_version(), 4);
    }

    #[test]
    fn test_info_before_spawn_creates_ownerless_session() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        let mut events = registry.subscribe();

        registry.apply_remote(vec![info(uuid, 0, "early")]);
        assert_eq!(registry.owner_of(uuid), None);
        registry.apply_remote(vec![ShellUpdate::Spawn { uuid, spawner: owner }]);
        assert_eq!(registry.owner_of(uuid), Some(owner));

        assert_eq!(
            events.try_recv().unwrap(),
            ShellEvent::Output { uuid, index: 0, data: "early".into() }
        );
        assert_eq!(events.try_recv().unwrap(), ShellEvent::Spawned { uuid, owner });
        assert_eq!(registry.sessions().len(), 1);
    }

    #[test]
    fn test_own_echo_acknowledges_silently() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        registry.spawn(uuid, owner);
        registry.append_output(uuid, "out").unwrap();
        let mut events = registry.subscribe();

        registry.apply_remote(vec![ShellUpdate::Spawn { uuid, spawner: owner }, info(uuid, 0, "out")]);
        assert_eq!(registry.queue_len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_respawn_of_registered_session_is_noop() {
        let registry = ShellRegistry::new();
        let (uuid, owner) = (Uuid::new_v4(), Uuid::new_v4());
        registry.spawn(uuid, owner);
        registry.acknowledge(&registry.pending_updates());
        registry.spawn(uuid, owner);
        assert_eq!(registry.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_lost_reply_is_not_resent_after_echo() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.transport("room", "Alice"));
        transport.connect().await.unwrap();
        let relay: Arc<dyn Relay> = transport.clone();

        let registry = Arc::new(ShellRegistry::new());
        let scheduler = RetryScheduler::default();
        scheduler.cancel();
        let stream = Arc::new(VersionedStream::new(
            ShellEndpoint::new(registry.clone(), relay, "room"),
            scheduler,
        ));

        let (uuid, owner) = (Uuid::new_v4(), transport.peer_id());
        registry.spawn(uuid, owner);
        registry.append_output(uuid, "hello\n").unwrap();

        // Relay stores the batch, the reply is lost
        transport.lose_replies(1);
        assert_eq!(stream.push().await, PushOutcome::NotApplied(2));
        assert_eq!(registry.queue_len(), 2);

        assert_eq!(stream.pull().await.unwrap(), PullOutcome::Applied(2));
        assert_eq!(registry.queue_len(), 0);
        assert_eq!(stream.push().await, PushOutcome::Idle);

        let room = hub.hub().rooms().get("room").await.unwrap();
        assert_eq!(room.with_log(|log| log.shell_version()), 2);
        assert_eq!(transport.call_count("pushShellUpdates"), 1);
    }

    #[test]
    fn test_event_capacity_bounds_backlog() {
        let registry = ShellRegistry::with_event_capacity(2);
        let mut events = registry.subscribe();
        let uuid = Uuid::new_v4();
        registry.spawn(uuid, Uuid::new_v4());
        registry.append_output(uuid, "a").unwrap();
        registry.append_output(uuid, "b").unwrap();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
    }
}
