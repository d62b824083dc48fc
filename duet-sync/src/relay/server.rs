//! WebSocket relay server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── Room (doc_name) ── RoomLog ── BroadcastGroup
//! Client B ──┘                                    │
//!                                     ┌───────────┼───────────┐
//!                                     ▼           ▼           ▼
//!                                  Client A    Client B    Client C
//! ```
//!
//! Every connection gets a fresh relay-assigned peer id. The first call on a
//! connection must be `subscribe`; after that, calls are answered by the
//! shared [`RelayHub`] and room events are forwarded as `event` frames.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{Membership, RelayHub};
use crate::config::ConfigError;
use crate::protocol::{Frame, RelayEvent, RelayRequest, RelayResponse};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RelayHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RelayHub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let peer_id = Uuid::new_v4();

        log::info!("WebSocket connection established from {addr} as {peer_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let mut room_rx: Option<tokio::sync::broadcast::Receiver<Arc<super::RoomEvent>>> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }

                                let (id, request) = match Frame::decode(text.as_str()) {
                                    Ok(Frame::Call { id, request }) => (id, request),
                                    Ok(other) => {
                                        log::warn!("Ignoring non-call frame from {addr}: {other:?}");
                                        continue;
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };

                                let response = if let Some(seat) = &membership {
                                    hub.handle(seat, request).await
                                } else if let RelayRequest::Subscribe { doc_name, name } = request {
                                    match hub.join(peer_id, &doc_name, &name).await {
                                        Ok((seat, rx)) => {
                                            membership = Some(seat);
                                            room_rx = Some(rx);
                                            let rooms = hub.rooms().room_count().await;
                                            stats.write().await.active_rooms = rooms;
                                            RelayResponse::Subscribed { self_id: peer_id }
                                        }
                                        Err(e) => RelayResponse::Error { reason: e.to_string() },
                                    }
                                } else {
                                    RelayResponse::Error {
                                        reason: format!("{} before subscribe", request.method()),
                                    }
                                };

                                let reply = Frame::Reply { id, response }.encode()?;
                                ws_sender.send(Message::Text(reply.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = async {
                        match room_rx {
                            Some(ref mut rx) => rx.recv().await,
                            // Not subscribed yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Ok(event) => {
                                if !event.is_for(peer_id) {
                                    continue;
                                }
                                let frame = Frame::Event { event: event.event.clone() }.encode()?;
                                ws_sender.send(Message::Text(frame.into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id} lagged by {n} events");
                                // Lost events may have been updates: make the client re-pull
                                for event in [RelayEvent::NewUpdates, RelayEvent::NewPeers] {
                                    let frame = Frame::Event { event }.encode()?;
                                    ws_sender.send(Message::Text(frame.into())).await?;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(seat) = membership {
            hub.leave(&seat).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}
