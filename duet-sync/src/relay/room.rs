//! Authoritative, version-sequenced logs for one room.
//!
//! The relay has no opinion about document content. It only serialises
//! proposals: a document batch is accepted when it was built against the
//! current version, and shell events are appended in arrival order.
//!
//! ```text
//! version:   0      1      2      3
//! updates: [ u0 ][ u1 ][ u2 ]          pushUpdates(v=3, [u3]) → accepted
//!                                     pushUpdates(v=2, [x])  → rejected
//! ```

use crate::protocol::{DocUpdate, ShellUpdate};

/// Document and shell logs of a single room.
#[derive(Debug, Default, Clone)]
pub struct RoomLog {
    updates: Vec<DocUpdate>,
    shell_updates: Vec<ShellUpdate>,
}

impl RoomLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current document version (number of accepted updates).
    pub fn version(&self) -> u64 {
        self.updates.len() as u64
    }

    /// Number of shell events appended so far.
    pub fn shell_version(&self) -> u64 {
        self.shell_updates.len() as u64
    }

    /// Append `updates` if they were built against the current version.
    pub fn push_updates(&mut self, version: u64, updates: Vec<DocUpdate>) -> bool {
        if version != self.version() {
            return false;
        }
        self.updates.extend(updates);
        true
    }

    /// Append shell events unconditionally.
    pub fn push_shell_updates(&mut self, shell_updates: Vec<ShellUpdate>) {
        self.shell_updates.extend(shell_updates);
    }

    /// Document updates after `version`, or `None` if `version` is ahead of
    /// the log.
    pub fn updates_since(&self, version: u64) -> Option<Vec<DocUpdate>> {
        let start = usize::try_from(version).ok()?;
        self.updates.get(start..).map(<[DocUpdate]>::to_vec)
    }

    /// Shell events after `shell_version`, or `None` if it is ahead of the log.
    pub fn shell_updates_since(&self, shell_version: u64) -> Option<Vec<ShellUpdate>> {
        let start = usize::try_from(shell_version).ok()?;
        self.shell_updates.get(start..).map(<[ShellUpdate]>::to_vec)
    }

    /// Full shell log, in relay order.
    pub fn shell_log(&self) -> &[ShellUpdate] {
        &self.shell_updates
    }
}
