//! Per-room fan-out of relay events with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all room members.
//! Each member gets an independent receiver that buffers up to `capacity`
//! events and filters what is not addressed to it (see [`RoomEvent::is_for`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};

use super::room::RoomLog;
use crate::protocol::{PeerId, PeerProfile, RelayEvent};

/// An event published into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomEvent {
    /// Peer whose action caused the event
    pub origin: PeerId,
    /// Single recipient, or `None` for every member except `origin`
    pub target: Option<PeerId>,
    pub event: RelayEvent,
}

impl RoomEvent {
    /// Event for every member except `origin`.
    pub fn to_others(origin: PeerId, event: RelayEvent) -> Self {
        Self { origin, target: None, event }
    }

    /// Event for `target` only.
    pub fn to_peer(origin: PeerId, target: PeerId, event: RelayEvent) -> Self {
        Self {
            origin,
            target: Some(target),
            event,
        }
    }

    /// Whether `peer` should see this event.
    pub fn is_for(&self, peer: PeerId) -> bool {
        match self.target {
            Some(target) => target == peer,
            None => self.origin != peer,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub active_peers: usize,
}

/// Broadcast group for the members of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomEvent>>,
    peers: Arc<RwLock<HashMap<PeerId, PeerProfile>>>,
    capacity: usize,
    events_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many events a slow member may lag behind before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            events_sent: AtomicU64::new(0),
        }
    }

    /// Add a member; returns its event receiver.
    pub async fn add_peer(
        &self,
        peer_id: PeerId,
        profile: PeerProfile,
    ) -> broadcast::Receiver<Arc<RoomEvent>> {
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, profile);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerProfile> {
        self.peers.write().await.remove(peer_id)
    }

    /// Publish an event. Returns the number of live receivers.
    pub fn publish(&self, event: RoomEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Snapshot of member profiles.
    pub async fn peers(&self) -> HashMap<PeerId, PeerProfile> {
        self.peers.read().await.clone()
    }

    pub async fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A room: its logs plus its broadcast group.
pub struct Room {
    name: String,
    log: Mutex<RoomLog>,
    group: BroadcastGroup,
}

impl Room {
    fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            log: Mutex::new(RoomLog::new()),
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` with the room log locked.
    pub fn with_log<R>(&self, f: impl FnOnce(&mut RoomLog) -> R) -> R {
        let mut log = self.log.lock();
        f(&mut log)
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }
}

/// Maps room names to rooms.
///
/// Rooms outlive their members so late joiners still see the full logs.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room called `name`.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        let room = Arc::new(Room::new(name.to_string(), self.default_capacity));
        rooms.insert(name.to_string(), room.clone());
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
