//! Relay connection abstraction.
//!
//! A [`Relay`] wraps one connection to a relay room and exposes the four
//! primitives the sync engine needs: connect, call, subscribe to events, and
//! a readiness query. Two implementations ship with the crate:
//!
//! - [`ws::WsTransport`] — JSON-RPC over a WebSocket (relay assigns peer ids)
//! - [`memory::MemoryTransport`] — in-process broadcast channel, for tests and
//!   single-process setups (random client ids)
//!
//! Event receivers obtained from [`Relay::subscribe`] survive reconnects: the
//! event channel belongs to the transport, not to the underlying socket.

pub mod memory;
pub mod ws;

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use crate::protocol::{PeerMessage, ProtocolError, RelayEvent, RelayRequest, RelayResponse, PeerId, PEER_CHANNEL};

pub use memory::{MemoryHub, MemoryTransport};
pub use ws::WsTransport;

/// Transport failures. None of these are fatal: callers treat them as
/// "nothing happened, try later".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Relay transport is not ready")]
    Unavailable,
    #[error("Relay call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Relay connection closed")]
    Closed,
    #[error("Relay rejected call: {0}")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One connection to a relay room.
pub trait Relay: Send + Sync {
    /// Open the connection and join the room. Emits [`RelayEvent::Open`].
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Issue one RPC. Fails with [`TransportError::Unavailable`] when not
    /// ready and with [`TransportError::Timeout`] when the relay is slow.
    fn call(&self, request: RelayRequest) -> BoxFuture<'_, Result<RelayResponse, TransportError>>;

    /// Receiver for relay events; stays valid across reconnects.
    fn subscribe(&self) -> broadcast::Receiver<RelayEvent>;

    fn is_ready(&self) -> bool;

    /// Close the connection. In-flight calls resolve to failure.
    fn disconnect(&self) -> BoxFuture<'_, ()>;

    /// Connect again unless already connected.
    fn reconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.is_ready() {
                return Ok(());
            }
            self.connect().await
        })
    }
}

/// Send a point-to-point peer message through the relay.
///
/// Returns whether the relay reported delivery; transport failures are
/// logged and reported as not delivered.
pub async fn send_to_peer(relay: &dyn Relay, to: PeerId, message: &PeerMessage) -> bool {
    let encoded = match message.encode() {
        Ok(encoded) => encoded,
        Err(e) => {
            log::warn!("Dropping {} for {to}: {e}", message.kind());
            return false;
        }
    };
    let request = RelayRequest::SendToPrivate {
        to,
        channel: PEER_CHANNEL.to_string(),
        message: encoded,
    };
    match relay.call(request).await {
        Ok(RelayResponse::Delivered(delivered)) => delivered,
        Ok(other) => {
            log::warn!("Unexpected reply to sendToPrivate: {other:?}");
            false
        }
        Err(e) => {
            log::debug!("sendToPrivate to {to} not applied: {e}");
            false
        }
    }
}
