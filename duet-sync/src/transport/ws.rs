//! WebSocket-RPC relay transport.
//!
//! ```text
//!   call() ──► pending[id] ──► writer task ──► ws ──► relay
//!                  ▲                                    │
//!                  └──── reader task ◄── reply/event ◄──┘
//!                               │
//!                               └──► events (broadcast, outlives the socket)
//! ```
//!
//! The relay assigns the peer id in its `subscribe` reply. A reconnect opens a
//! fresh socket and therefore yields a fresh id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Relay, TransportError};
use crate::config::SyncConfig;
use crate::protocol::{Frame, PeerId, ProtocolError, RelayEvent, RelayRequest, RelayResponse};

type PendingCalls = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<RelayResponse>>>>;

/// Socket-bound half of the transport, replaced on every connect.
struct Link {
    outgoing: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Relay transport over a WebSocket connection.
pub struct WsTransport {
    url: String,
    doc_name: String,
    display_name: String,
    call_timeout: Duration,
    events: broadcast::Sender<RelayEvent>,
    link: Mutex<Option<Link>>,
    pending: PendingCalls,
    ready: Arc<AtomicBool>,
    next_id: AtomicU64,
    self_id: parking_lot::Mutex<Option<PeerId>>,
}

impl WsTransport {
    pub fn new(config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            url: config.relay_url.clone(),
            doc_name: config.doc_name.clone(),
            display_name: config.display_name.clone(),
            call_timeout: config.call_timeout(),
            events,
            link: Mutex::new(None),
            pending: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            ready: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            self_id: parking_lot::Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Id the relay assigned on the current connection.
    pub fn peer_id(&self) -> Option<PeerId> {
        *self.self_id.lock()
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        if link.is_some() && self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.abort();
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                log::debug!("Relay {} unreachable: {e}", self.url);
                TransportError::Unavailable
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: resolve replies, fan out events
        let pending = self.pending.clone();
        let events = self.events.clone();
        let ready = self.ready.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(Frame::Reply { id, response }) => {
                            let waiter = pending.lock().remove(&id);
                            if let Some(tx) = waiter {
                                let _ = tx.send(response);
                            }
                        }
                        Ok(Frame::Event { event }) => {
                            let _ = events.send(event);
                        }
                        Ok(Frame::Call { id, .. }) => {
                            log::warn!("Relay sent a call frame ({id}); ignoring");
                        }
                        Err(e) => log::warn!("Undecodable relay frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail in-flight calls
            pending.lock().clear();
            if ready.swap(false, Ordering::SeqCst) {
                log::info!("Relay connection lost");
                let _ = events.send(RelayEvent::Close);
            }
        });

        let outgoing = out_tx.clone();
        *link = Some(Link {
            outgoing: out_tx,
            reader,
            writer,
        });

        let subscribe = RelayRequest::Subscribe {
            doc_name: self.doc_name.clone(),
            name: self.display_name.clone(),
        };
        let self_id = match self.exchange(&outgoing, subscribe).await {
            Ok(RelayResponse::Subscribed { self_id }) => self_id,
            Ok(_) => {
                if let Some(dead) = link.take() {
                    dead.abort();
                }
                return Err(ProtocolError::UnexpectedResponse { method: "subscribe" }.into());
            }
            Err(e) => {
                if let Some(dead) = link.take() {
                    dead.abort();
                }
                return Err(e);
            }
        };

        *self.self_id.lock() = Some(self_id);
        self.ready.store(true, Ordering::SeqCst);
        log::info!("Joined {} on {} as {self_id}", self.doc_name, self.url);
        let _ = self.events.send(RelayEvent::Open);
        Ok(())
    }

    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, TransportError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        let outgoing = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outgoing.clone())
            .ok_or(TransportError::Unavailable)?;
        self.exchange(&outgoing, request).await
    }

    /// Send one call frame and wait for its reply.
    async fn exchange(
        &self,
        outgoing: &mpsc::Sender<String>,
        request: RelayRequest,
    ) -> Result<RelayResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = request.method();
        let text = Frame::Call { id, request }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if outgoing.send(text).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(RelayResponse::Error { reason })) => Err(TransportError::Rejected(reason)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                log::debug!("{method} #{id} timed out");
                Err(TransportError::Timeout(self.call_timeout))
            }
        }
    }

    async fn close(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.abort();
        }
        self.pending.lock().clear();
        *self.self_id.lock() = None;
        if self.ready.swap(false, Ordering::SeqCst) {
            log::info!("Disconnected from {}", self.url);
            let _ = self.events.send(RelayEvent::Close);
        }
    }
}

impl Relay for WsTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.open())
    }

    fn call(&self, request: RelayRequest) -> BoxFuture<'_, Result<RelayResponse, TransportError>> {
        Box::pin(self.request(request))
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.abort();
        }
    }
}
