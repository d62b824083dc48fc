//! Shared text buffer bound to the document stream.
//!
//! Local edits are applied to a yrs text immediately and recorded as
//! unconfirmed [`DocUpdate`]s (one incremental v1 update per edit). The
//! relay's document log is the only thing that advances [`SharedDocument::version`]:
//!
//! ```text
//!  insert/delete ──► yrs txn ──► unconfirmed ──push──► relay log
//!                                    ▲                    │
//!                     own echo ──────┘        pull ◄──────┘
//!                     remote  ──► apply_update, version += n
//! ```
//!
//! Offsets are UTF-8 byte offsets and must fall on character boundaries.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, TextRef, Transact, Update};

use crate::error::SyncError;
use crate::protocol::{DocUpdate, RelayRequest, RelayResponse};
use crate::stream::{Pulled, StreamEndpoint};
use crate::transport::Relay;

/// Name of the root text inside the yrs document.
const TEXT_NAME: &str = "content";

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification about the document contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    /// A local edit was recorded.
    Local,
    /// Relay-confirmed changes from other peers were applied.
    Remote { version: u64 },
}

struct DocState {
    doc: Doc,
    text: TextRef,
    version: u64,
    unconfirmed: VecDeque<DocUpdate>,
}

/// The co-edited text buffer.
pub struct SharedDocument {
    client_id: Uuid,
    state: Mutex<DocState>,
    local_changes: Notify,
    events: broadcast::Sender<DocumentChange>,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::with_client_id(Uuid::new_v4())
    }

    /// `client_id` tags every update this replica produces.
    pub fn with_client_id(client_id: Uuid) -> Self {
        Self::with_options(client_id, DEFAULT_EVENT_CAPACITY)
    }

    /// Subscribers lagging more than `event_capacity` changes miss the oldest.
    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self::with_options(Uuid::new_v4(), event_capacity)
    }

    fn with_options(client_id: Uuid, event_capacity: usize) -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            client_id,
            state: Mutex::new(DocState {
                doc,
                text,
                version: 0,
                unconfirmed: VecDeque::new(),
            }),
            local_changes: Notify::new(),
            events,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn text(&self) -> String {
        let state = self.state.lock();
        let txn = state.doc.transact();
        state.text.get_string(&txn)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Relay version this replica has applied up to.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.state.lock().unconfirmed.len()
    }

    /// Local updates not yet seen back from the relay, oldest first.
    pub fn unconfirmed(&self) -> Vec<DocUpdate> {
        self.state.lock().unconfirmed.iter().cloned().collect()
    }

    pub fn insert(&self, offset: usize, text: &str) -> Result<(), SyncError> {
        self.replace(offset, 0, text)
    }

    pub fn delete(&self, offset: usize, len: usize) -> Result<(), SyncError> {
        self.replace(offset, len, "")
    }

    /// Replace `len` bytes at `offset` with `text`.
    pub fn replace(&self, offset: usize, len: usize, text: &str) -> Result<(), SyncError> {
        self.edit(|current| {
            let end = offset.checked_add(len).unwrap_or(usize::MAX);
            for bound in [offset, end] {
                if bound > current.len() || !current.is_char_boundary(bound) {
                    return Err(SyncError::OutOfRange {
                        offset: bound,
                        len: current.len(),
                    });
                }
            }
            Ok(Some(Splice {
                start: offset,
                removed: len,
                inserted: text.to_string(),
            }))
        })
    }

    /// Make the text equal `content` with the smallest single-range edit.
    pub fn set_text(&self, content: &str) {
        if let Err(e) = self.edit(|current| Ok(diff(current, content))) {
            log::warn!("set_text diff rejected: {e}");
        }
    }

    /// Plan an edit against the current text and record it. Planning and
    /// the yrs transaction share one lock, so offsets are never stale.
    fn edit(
        &self,
        plan: impl FnOnce(&str) -> Result<Option<Splice>, SyncError>,
    ) -> Result<(), SyncError> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let current = state.text.get_string(&state.doc.transact());
            let Some(splice) = plan(&current)? else {
                return Ok(());
            };
            let start = to_index(splice.start, current.len())?;
            let removed = to_index(splice.removed, current.len())?;
            if removed == 0 && splice.inserted.is_empty() {
                return Ok(());
            }

            let before = state.doc.transact().state_vector();
            {
                let mut txn = state.doc.transact_mut();
                if removed > 0 {
                    state.text.remove_range(&mut txn, start, removed);
                }
                if !splice.inserted.is_empty() {
                    state.text.insert(&mut txn, start, &splice.inserted);
                }
            }
            let changes = state.doc.transact().encode_state_as_update_v1(&before);
            state.unconfirmed.push_back(DocUpdate {
                client_id: self.client_id,
                changes,
            });
        }
        self.local_changes.notify_one();
        let _ = self.events.send(DocumentChange::Local);
        Ok(())
    }

    /// Apply a relay-confirmed batch.
    ///
    /// Own updates confirm their unconfirmed counterpart and are not applied
    /// twice. Nothing changes if any update fails to decode.
    pub fn receive(&self, items: Vec<DocUpdate>) -> Result<(), SyncError> {
        let count = items.len() as u64;
        let version = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut remote = Vec::new();
            let mut echoes = Vec::new();
            for item in items {
                if item.client_id == self.client_id && state.unconfirmed.contains(&item) {
                    echoes.push(item);
                } else {
                    let update = Update::decode_v1(&item.changes)
                        .map_err(|e| SyncError::Decode(e.to_string()))?;
                    remote.push(update);
                }
            }

            let applied = !remote.is_empty();
            if applied {
                let mut txn = state.doc.transact_mut();
                for update in remote {
                    txn.apply_update(update)
                        .map_err(|e| SyncError::Apply(e.to_string()))?;
                }
            }
            for echo in echoes {
                if let Some(pos) = state.unconfirmed.iter().position(|u| *u == echo) {
                    state.unconfirmed.remove(pos);
                }
            }
            state.version += count;
            applied.then_some(state.version)
        };

        if let Some(version) = version {
            let _ = self.events.send(DocumentChange::Remote { version });
        }
        Ok(())
    }

    /// Resolves after the next local edit.
    pub async fn changed(&self) {
        self.local_changes.notified().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.events.subscribe()
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// One contiguous edit in byte offsets.
struct Splice {
    start: usize,
    removed: usize,
    inserted: String,
}

/// Smallest single-range edit turning `current` into `content`.
fn diff(current: &str, content: &str) -> Option<Splice> {
    if current == content {
        return None;
    }
    let prefix: usize = current
        .chars()
        .zip(content.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let max_suffix = (current.len() - prefix).min(content.len() - prefix);
    let suffix: usize = current[prefix..]
        .chars()
        .rev()
        .zip(content[prefix..].chars().rev())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .scan(0usize, |total, n| {
            *total += n;
            (*total <= max_suffix).then_some(n)
        })
        .sum();

    Some(Splice {
        start: prefix,
        removed: current.len() - prefix - suffix,
        inserted: content[prefix..content.len() - suffix].to_string(),
    })
}

fn to_index(value: usize, len: usize) -> Result<u32, SyncError> {
    u32::try_from(value).map_err(|_| SyncError::OutOfRange { offset: value, len })
}

/// Binds a [`SharedDocument`] to the relay's document log.
pub struct DocumentEndpoint {
    document: Arc<SharedDocument>,
    relay: Arc<dyn Relay>,
    doc_name: String,
}

impl DocumentEndpoint {
    pub fn new(document: Arc<SharedDocument>, relay: Arc<dyn Relay>, doc_name: impl Into<String>) -> Self {
        Self {
            document,
            relay,
            doc_name: doc_name.into(),
        }
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }
}

impl StreamEndpoint for DocumentEndpoint {
    type Item = DocUpdate;

    fn name(&self) -> &'static str {
        "document"
    }

    fn synced_version(&self) -> u64 {
        self.document.version()
    }

    fn pending_items(&self) -> Vec<DocUpdate> {
        self.document.unconfirmed()
    }

    fn push_remote(&self, version: u64, items: Vec<DocUpdate>) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let request = RelayRequest::PushUpdates {
                doc_name: self.doc_name.clone(),
                version,
                updates: items,
            };
            match self.relay.call(request).await {
                Ok(RelayResponse::Pushed(accepted)) => accepted,
                Ok(other) => {
                    log::warn!("Unexpected reply to pushUpdates: {other:?}");
                    false
                }
                Err(e) => {
                    log::debug!("pushUpdates not applied: {e}");
                    false
                }
            }
        })
    }

    fn pull_remote(&self, version: u64) -> BoxFuture<'_, Option<Pulled<DocUpdate>>> {
        Box::pin(async move {
            let request = RelayRequest::PullUpdates {
                doc_name: self.doc_name.clone(),
                version: Some(version),
                shell_version: None,
            };
            match self.relay.call(request).await {
                Ok(RelayResponse::Pulled { updates, version: last_version, .. }) => Some(Pulled {
                    items: updates,
                    last_version,
                }),
                Ok(other) => {
                    log::warn!("Unexpected reply to pullUpdates: {other:?}");
                    None
                }
                Err(e) => {
                    log::debug!("pullUpdates not applied: {e}");
                    None
                }
            }
        })
    }

    fn apply_local(&self, pulled: Pulled<DocUpdate>) -> Result<(), SyncError> {
        self.document.receive(pulled.items)
    }
}
