//! Engine-level errors.

use uuid::Uuid;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::router::RouteError;
use crate::transport::TransportError;

/// Errors surfaced by the sync engine.
///
/// Transport failures are normally swallowed at relay call sites and turned
/// into "not applied"; they only appear here when an operation explicitly
/// needs the relay (e.g. [`crate::Session::join`]).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A pulled batch does not line up with the local version. The stream
    /// can no longer be trusted and stops syncing.
    #[error(
        "{stream} stream out of sync: pulled {count} items at v{base}, relay reports v{last_version}"
    )]
    ApplyConflict {
        stream: &'static str,
        base: u64,
        last_version: u64,
        count: usize,
    },

    #[error("Undecodable update: {0}")]
    Decode(String),

    #[error("Update could not be applied: {0}")]
    Apply(String),

    #[error("Unknown shell session {0}")]
    UnknownShell(Uuid),

    #[error("Offset {offset} is outside the document (length {len})")]
    OutOfRange { offset: usize, len: usize },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Route(#[from] RouteError),
}
