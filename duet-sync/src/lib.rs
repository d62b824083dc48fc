//! # duet-sync — Client-side sync engine for a shared code pad
//!
//! Keeps one text document and a set of process-output shells in sync
//! between peers through a relay that only sequences and fans out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── Session ─────────────────────────────┐
//! │                                                                  │
//! │  SharedDocument ── VersionedStream ──┐                           │
//! │   (yrs text)        (doc)            │                           │
//! │                                      ├── Relay ◄──────► relay    │
//! │  ShellRegistry ─── VersionedStream ──┤   (ws | memory)   (hub)   │
//! │   (ack queue)       (shells)         │                           │
//! │                                      │                           │
//! │  PeerRouter ── LocalDispatch ────────┘                           │
//! │   (compile / keystrokes)  └── ProcessRunner, CompileOutput       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire types (relay calls, events, peer messages)
//! - [`transport`] — [`Relay`] connection over WebSocket or in-process
//! - [`stream`] — versioned push/pull with retry
//! - [`document`] — the shared text and its update stream endpoint
//! - [`shell`] — shell sessions, output ack queue, index padding
//! - [`router`] — peer message routing
//! - [`session`] — connection state machine tying it all together
//! - [`relay`] — reference relay (hub + WebSocket server)

pub mod config;
pub mod document;
pub mod error;
pub mod peers;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod shell;
pub mod stream;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, SyncConfig};
pub use document::{DocumentChange, DocumentEndpoint, SharedDocument};
pub use error::SyncError;
pub use peers::{Peer, PeerDirectory};
pub use protocol::{
    DocUpdate, PeerId, PeerMessage, PeerProfile, ProtocolError, RelayEvent, RelayRequest,
    RelayResponse, ShellUpdate,
};
pub use relay::{RelayHub, RelayServer, ServerConfig};
pub use router::{
    CompileOutput, Destination, LocalDispatch, PeerRouter, ProcessRunner, RouteContext,
    RouteError, RouteOutcome,
};
pub use scheduler::{BackoffPolicy, RetryScheduler};
pub use session::{ConnectionState, Session, SessionEvent, ShellHost};
pub use shell::{OutputRecord, ShellEndpoint, ShellEvent, ShellRegistry, ShellSession};
pub use stream::{PullOutcome, Pulled, PushOutcome, SkipReason, StreamEndpoint, VersionedStream};
pub use transport::{MemoryHub, MemoryTransport, Relay, TransportError, WsTransport};
