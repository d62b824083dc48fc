//! Client-side sync configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::BackoffPolicy;

/// Room joined when none is configured.
pub const DEFAULT_ROOM: &str = "welcome-room";

/// Knobs for one [`Session`](crate::session::Session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Relay WebSocket URL
    pub relay_url: String,
    /// Room (document) name shared by all peers
    pub doc_name: String,
    /// Name shown to other peers
    pub display_name: String,
    /// Per-call relay timeout in milliseconds
    pub call_timeout_ms: u64,
    /// First push retry delay in milliseconds
    pub retry_base_ms: u64,
    /// Upper bound for the push retry delay in milliseconds
    pub retry_max_ms: u64,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            doc_name: DEFAULT_ROOM.to_string(),
            display_name: format!("Anonymous {}", Uuid::new_v4().as_u128() % 100),
            call_timeout_ms: 5_000,
            retry_base_ms: 100,
            retry_max_ms: 3_200,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Defaults for the given room and display name.
    pub fn for_room(doc_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.doc_name.is_empty() {
            return Err(ConfigError::Invalid("doc_name must not be empty"));
        }
        if self.retry_base_ms == 0 || self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid("retry_max_ms must be >= retry_base_ms > 0"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive"));
        }
        Ok(())
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}
