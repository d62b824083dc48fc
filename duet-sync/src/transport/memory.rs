//! In-process relay transport (broadcast-channel variant).
//!
//! Every [`MemoryTransport`] created from the same [`MemoryHub`] talks to the
//! same [`RelayHub`], so several sessions in one process behave exactly as if
//! they were connected to a WebSocket relay. Peer ids are random client ids
//! minted once per transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Relay, TransportError};
use crate::protocol::{PeerId, RelayEvent, RelayRequest, RelayResponse};
use crate::relay::{Membership, RelayHub};

/// Shared in-process relay.
#[derive(Clone)]
pub struct MemoryHub {
    hub: Arc<RelayHub>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_hub(Arc::new(RelayHub::new(256, usize::MAX)))
    }

    pub fn with_hub(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// A new, not yet connected, transport for room `doc_name`.
    pub fn transport(&self, doc_name: impl Into<String>, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport::new(self.hub.clone(), doc_name.into(), name.into())
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

struct Seat {
    membership: Membership,
    forwarder: JoinHandle<()>,
}

/// Relay transport backed by an in-process [`RelayHub`].
pub struct MemoryTransport {
    hub: Arc<RelayHub>,
    peer_id: PeerId,
    doc_name: String,
    name: String,
    events: broadcast::Sender<RelayEvent>,
    seat: Mutex<Option<Seat>>,
    ready: AtomicBool,
    latency: parking_lot::Mutex<Duration>,
    calls: parking_lot::Mutex<HashMap<&'static str, usize>>,
    lost_replies: AtomicUsize,
}

impl MemoryTransport {
    fn new(hub: Arc<RelayHub>, doc_name: String, name: String) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            hub,
            peer_id: Uuid::new_v4(),
            doc_name,
            name,
            events,
            seat: Mutex::new(None),
            ready: AtomicBool::new(false),
            latency: parking_lot::Mutex::new(Duration::ZERO),
            calls: parking_lot::Mutex::new(HashMap::new()),
            lost_replies: AtomicUsize::new(0),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Apply the next `count` calls at the relay but report them as timed
    /// out, like a reply lost on the way back.
    pub fn lose_replies(&self, count: usize) {
        self.lost_replies.store(count, Ordering::SeqCst);
    }

    /// How many times `method` reached the relay.
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut seat = self.seat.lock().await;
        if seat.is_some() {
            return Ok(());
        }

        let (membership, mut rx) = self
            .hub
            .join(self.peer_id, &self.doc_name, &self.name)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let peer_id = self.peer_id;
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.is_for(peer_id) {
                            let _ = events.send(event.event.clone());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {peer_id} lagged by {n} events");
                        let _ = events.send(RelayEvent::NewUpdates);
                        let _ = events.send(RelayEvent::NewPeers);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *seat = Some(Seat { membership, forwarder });
        self.ready.store(true, Ordering::SeqCst);
        let _ = self.events.send(RelayEvent::Open);
        Ok(())
    }

    async fn request(&self, request: RelayRequest) -> Result<RelayResponse, TransportError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable);
        }
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        // Disconnected while the call was in flight
        let membership = match self.seat.lock().await.as_ref() {
            Some(seat) => seat.membership.clone(),
            None => return Err(TransportError::Closed),
        };

        let method = request.method();
        *self.calls.lock().entry(method).or_insert(0) += 1;
        let response = self.hub.handle(&membership, request).await;

        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            log::debug!("Dropping reply to {method}");
            return Err(TransportError::Timeout(latency));
        }

        match response {
            RelayResponse::Error { reason } => Err(TransportError::Rejected(reason)),
            response => Ok(response),
        }
    }

    async fn close(&self) {
        let seat = self.seat.lock().await.take();
        if let Some(seat) = seat {
            seat.forwarder.abort();
            self.hub.leave(&seat.membership).await;
        }
        if self.ready.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(RelayEvent::Close);
        }
    }
}

impl Relay for MemoryTransport {
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
