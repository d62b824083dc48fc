//! JSON wire protocol shared by the sync client and the relay.
//!
//! Every WebSocket text frame carries one [`Frame`]:
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ kind       │ body                                         │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ "call"     │ id + RelayRequest   {method, params}         │
//! │ "reply"    │ id + RelayResponse  {result, value}          │
//! │ "event"    │ RelayEvent          {event, ...}             │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Document updates and shell events keep the shapes the editor and the
//! Process Runner already speak:
//! - document update: `{clientId, changes}` (changes = yrs v1 update bytes)
//! - shell event: `{type: "spawn", uuid, spawner} | {type: "info", uuid, index, data}`
//! - peer message: `{type: "compile.request" | "compile.append" | ..., ...}`

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relay-assigned connection identity of a peer.
pub type PeerId = Uuid;

/// Channel name used for point-to-point peer messages.
pub const PEER_CHANNEL: &str = "peer";

/// One document operation batch as stored in the relay's room log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdate {
    /// Stable id of the document replica that produced the change.
    pub client_id: Uuid,
    /// Opaque changeset (yrs v1 update).
    pub changes: Vec<u8>,
}

/// A shell-session event as it travels through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShellUpdate {
    /// A peer registered a new shell session it owns.
    Spawn { uuid: Uuid, spawner: PeerId },
    /// Output record `index` of session `uuid`.
    Info { uuid: Uuid, index: usize, data: String },
}

impl ShellUpdate {
    /// Session this event belongs to.
    pub fn session_id(&self) -> Uuid {
        match self {
            ShellUpdate::Spawn { uuid, .. } | ShellUpdate::Info { uuid, .. } => *uuid,
        }
    }
}

/// Messages routed between peers (or dispatched locally) by the `PeerRouter`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Ask the receiving peer's Process Runner to compile and run `source`.
    #[serde(rename = "compile.request")]
    CompileRequest { source: String },
    /// Append compiler output on the requesting peer.
    #[serde(rename = "compile.append")]
    CompileAppend { text: String },
    /// Replace the compiler output pane on the requesting peer.
    #[serde(rename = "compile.replace")]
    CompileReplace { text: String },
    /// Keystrokes for the process behind shell `uuid`.
    #[serde(rename = "shell.keystroke")]
    ShellKeystroke { uuid: Uuid, text: String },
}

impl PeerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::CompileRequest { .. } => "compile.request",
            PeerMessage::CompileAppend { .. } => "compile.append",
            PeerMessage::CompileReplace { .. } => "compile.replace",
            PeerMessage::ShellKeystroke { .. } => "shell.keystroke",
        }
    }
}

/// Display metadata the relay keeps for each connected peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerProfile {
    pub name: String,
    /// CSS hex colour, stable for a given peer id.
    pub color: String,
}

impl PeerProfile {
    pub fn new(peer_id: PeerId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: peer_color(peer_id),
        }
    }
}

/// Stable, saturated colour derived from a peer id.
pub fn peer_color(peer_id: PeerId) -> String {
    let hue = (peer_id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Relay RPC surface
// ───────────────────────────────────────────────────────────────────

/// Relay RPC methods.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RelayRequest {
    /// Join the room `doc_name` under a display name.
    Subscribe { doc_name: String, name: String },
    PushUpdates {
        doc_name: String,
        version: u64,
        updates: Vec<DocUpdate>,
    },
    /// Each stream pulls only its own log; `None` skips that log.
    PullUpdates {
        doc_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell_version: Option<u64>,
    },
    PushShellUpdates {
        doc_name: String,
        shell_version: u64,
        shell_updates: Vec<ShellUpdate>,
    },
    GetPeers,
    SendToPrivate {
        to: PeerId,
        channel: String,
        message: String,
    },
}

impl RelayRequest {
    /// RPC method name, for logging and call accounting.
    pub fn method(&self) -> &'static str {
        match self {
            RelayRequest::Subscribe { .. } => "subscribe",
            RelayRequest::PushUpdates { .. } => "pushUpdates",
            RelayRequest::PullUpdates { .. } => "pullUpdates",
            RelayRequest::PushShellUpdates { .. } => "pushShellUpdates",
            RelayRequest::GetPeers => "getPeers",
            RelayRequest::SendToPrivate { .. } => "sendToPrivate",
        }
    }
}

/// Relay RPC results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "result",
    content = "value",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum RelayResponse {
    Subscribed { self_id: PeerId },
    /// Answer to `pushUpdates` and `pushShellUpdates`.
    Pushed(bool),
    /// `version` and `shell_version` are the room's log lengths when the
    /// pull was served. A log is returned empty if the requested version is
    /// ahead of it.
    Pulled {
        updates: Vec<DocUpdate>,
        shell_updates: Vec<ShellUpdate>,
        version: u64,
        shell_version: u64,
    },
    Peers {
        self_id: PeerId,
        peers: HashMap<PeerId, PeerProfile>,
    },
    Delivered(bool),
    Error { reason: String },
}

/// Events pushed by the relay (or synthesised by the transport for
/// `Open`/`Close`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RelayEvent {
    Open,
    NewUpdates,
    NewPeers,
    Message {
        from: PeerId,
        channel: String,
        message: String,
    },
    Close,
}

/// One WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Frame {
    Call { id: u64, request: RelayRequest },
    Reply { id: u64, response: RelayResponse },
    Event { event: RelayEvent },
}

impl Frame {
    /// Serialize to the JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unexpected response to {method}")]
    UnexpectedResponse { method: &'static str },
}
