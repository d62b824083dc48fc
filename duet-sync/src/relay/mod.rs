//! Reference relay: sequencing and fan-out, no authority over content.
//!
//! ```text
//!   MemoryTransport ──┐                 ┌── RoomLog (versions)
//!                     ├── RelayHub ─────┤
//!   RelayServer (ws) ─┘                 └── BroadcastGroup (events)
//! ```
//!
//! Both the in-process transport and the WebSocket server drive the same
//! [`RelayHub`], so the two relay variants behave identically.

pub mod broadcast;
pub mod room;
pub mod server;

use std::sync::Arc;

pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomEvent, RoomManager};
pub use room::RoomLog;
pub use server::{RelayServer, ServerConfig, ServerStats};

use crate::protocol::{PeerId, PeerProfile, RelayEvent, RelayRequest, RelayResponse};

/// A peer's seat in a room.
#[derive(Clone)]
pub struct Membership {
    pub peer_id: PeerId,
    pub room: Arc<Room>,
}

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Room {0} is full")]
    RoomFull(String),
    #[error("Room name must not be empty")]
    EmptyRoomName,
}

/// Request handling shared by every relay front end.
pub struct RelayHub {
    rooms: RoomManager,
    max_peers_per_room: usize,
}

impl RelayHub {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: usize) -> Self {
        Self {
            rooms: RoomManager::new(broadcast_capacity),
            max_peers_per_room,
        }
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// Seat `peer_id` in `doc_name` and announce it to the other members.
    pub async fn join(
        &self,
        peer_id: PeerId,
        doc_name: &str,
        name: &str,
    ) -> Result<(Membership, tokio::sync::broadcast::Receiver<Arc<RoomEvent>>), JoinError> {
        if doc_name.is_empty() {
            return Err(JoinError::EmptyRoomName);
        }
        let room = self.rooms.get_or_create(doc_name).await;
        if room.group().peer_count().await >= self.max_peers_per_room {
            return Err(JoinError::RoomFull(doc_name.to_string()));
        }
        let rx = room
            .group()
            .add_peer(peer_id, PeerProfile::new(peer_id, name))
            .await;
        room.group()
            .publish(RoomEvent::to_others(peer_id, RelayEvent::NewPeers));
        log::info!("Peer {name} ({peer_id}) joined room {doc_name}");
        Ok((Membership { peer_id, room }, rx))
    }

    /// Remove a member and announce the departure.
    pub async fn leave(&self, membership: &Membership) {
        let room = &membership.room;
        if room.group().remove_peer(&membership.peer_id).await.is_some() {
            room.group()
                .publish(RoomEvent::to_others(membership.peer_id, RelayEvent::NewPeers));
            log::info!("Peer {} left room {}", membership.peer_id, room.name());
        }
    }

    /// Answer one RPC on behalf of a seated peer.
    pub async fn handle(&self, membership: &Membership, request: RelayRequest) -> RelayResponse {
        let room = &membership.room;
        let me = membership.peer_id;

        match request {
            RelayRequest::Subscribe { .. } => RelayResponse::Error {
                reason: "already subscribed".to_string(),
            },

            RelayRequest::PushUpdates { doc_name, version, updates } => {
                if doc_name != room.name() {
                    return wrong_room(&doc_name);
                }
                let count = updates.len();
                let accepted = room.with_log(|log| log.push_updates(version, updates));
                if accepted && count > 0 {
                    room.group().publish(RoomEvent::to_others(me, RelayEvent::NewUpdates));
                }
                log::debug!("pushUpdates from {me} at v{version}: {count} updates, accepted={accepted}");
                RelayResponse::Pushed(accepted)
            }

            RelayRequest::PullUpdates { doc_name, version, shell_version } => {
                if doc_name != room.name() {
                    return wrong_room(&doc_name);
                }
                let (pulled, ahead) = room.with_log(|log| {
                    let (updates, doc_ahead) = since(version, |v| log.updates_since(v));
                    let (shell_updates, shell_ahead) = since(shell_version, |v| log.shell_updates_since(v));
                    let pulled = RelayResponse::Pulled {
                        updates,
                        shell_updates,
                        version: log.version(),
                        shell_version: log.shell_version(),
                    };
                    (pulled, doc_ahead || shell_ahead)
                });
                if ahead {
                    log::warn!(
                        "pullUpdates from {me} is ahead of room {} (v{version:?}, shell v{shell_version:?})",
                        room.name()
                    );
                }
                pulled
            }

            RelayRequest::PushShellUpdates { doc_name, shell_updates, .. } => {
                if doc_name != room.name() {
                    return wrong_room(&doc_name);
                }
                let count = shell_updates.len();
                room.with_log(|log| log.push_shell_updates(shell_updates));
                if count > 0 {
                    room.group().publish(RoomEvent::to_others(me, RelayEvent::NewUpdates));
                }
                RelayResponse::Pushed(true)
            }

            RelayRequest::GetPeers => RelayResponse::Peers {
                self_id: me,
                peers: room.group().peers().await,
            },

            RelayRequest::SendToPrivate { to, channel, message } => {
                if !room.group().has_peer(&to).await {
                    log::warn!("Private message from {me} to unknown peer {to}");
                    return RelayResponse::Delivered(false);
                }
                room.group().publish(RoomEvent::to_peer(
                    me,
                    to,
                    RelayEvent::Message { from: me, channel, message },
                ));
                RelayResponse::Delivered(true)
            }
        }
    }
}

fn wrong_room(doc_name: &str) -> RelayResponse {
    RelayResponse::Error {
        reason: format!("not subscribed to {doc_name}"),
    }
}

/// Entries after `version` if one was requested, and whether it was ahead
/// of the log.
fn since<T>(version: Option<u64>, read: impl FnOnce(u64) -> Option<Vec<T>>) -> (Vec<T>, bool) {
    match version {
        Some(v) => match read(v) {
            Some(entries) => (entries, false),
            None => (Vec::new(), true),
        },
        None => (Vec::new(), false),
    }
}
