//! Room membership as last reported by the relay.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::protocol::{PeerId, PeerProfile, RelayRequest, RelayResponse};
use crate::transport::Relay;

/// A peer in the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub color: String,
}

#[derive(Default)]
struct Directory {
    self_id: Option<PeerId>,
    peers: HashMap<PeerId, Peer>,
}

/// Peer list refreshed on `open` and `newPeers`.
#[derive(Default)]
pub struct PeerDirectory {
    inner: RwLock<Directory>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the peer list. Returns `false` if the relay did not answer.
    pub async fn refresh(&self, relay: &dyn Relay) -> bool {
        match relay.call(RelayRequest::GetPeers).await {
            Ok(RelayResponse::Peers { self_id, peers }) => {
                self.replace(self_id, peers);
                true
            }
            Ok(other) => {
                log::warn!("Unexpected reply to getPeers: {other:?}");
                false
            }
            Err(e) => {
                log::debug!("getPeers not applied: {e}");
                false
            }
        }
    }

    pub fn replace(&self, self_id: PeerId, profiles: HashMap<PeerId, PeerProfile>) {
        let peers = profiles
            .into_iter()
            .map(|(id, profile)| {
                (
                    id,
                    Peer {
                        id,
                        name: profile.name,
                        color: profile.color,
                    },
                )
            })
            .collect();
        let mut dir = self.inner.write();
        dir.self_id = Some(self_id);
        dir.peers = peers;
    }

    /// Forget the peer list but keep the last known own id.
    pub fn clear(&self) {
        self.inner.write().peers.clear();
    }

    /// Own id on the current (or last) connection.
    pub fn self_id(&self) -> Option<PeerId> {
        self.inner.read().self_id
    }

    pub fn get(&self, id: PeerId) -> Option<Peer> {
        self.inner.read().peers.get(&id).cloned()
    }

    /// Peers sorted by name, then id.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.read().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
