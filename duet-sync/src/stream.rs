//! Version-counted push/pull reconciliation against the relay.
//!
//! A [`VersionedStream`] owns no data of its own. Its [`StreamEndpoint`]
//! says where the synced version and the unconfirmed items live and how to
//! talk to the relay; the stream adds the concurrency discipline:
//!
//! ```text
//!            local change                      newUpdates / init
//!                 │                                   │
//!                 ▼                                   ▼
//!   push() ── in flight? ── drop          pull() ── in flight? ── drop
//!     │                                     │
//!     ├─ push_remote(version, pending)      ├─ pull_remote(version)
//!     │                                     ├─ check base + n == last_version
//!     └─ pending left? ──► pull, backoff,   ├─ apply_local
//!                          push again       └─ check version == last_version
//! ```
//!
//! At most one push and one pull run per stream. A failed or partial push
//! reschedules itself through the [`RetryScheduler`], so shutting the
//! scheduler down stops the retry chain.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::SyncError;
use crate::scheduler::RetryScheduler;

/// Result of one successful `pull_remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pulled<T> {
    /// Items after the requested version, in relay order.
    pub items: Vec<T>,
    /// Version the stream reaches once `items` are applied.
    pub last_version: u64,
}

/// What a [`VersionedStream`] reconciles: a local source of items plus the
/// relay calls that confirm them.
pub trait StreamEndpoint: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Short name for logs and errors.
    fn name(&self) -> &'static str;

    fn synced_version(&self) -> u64;

    /// Locally produced items not yet confirmed by the relay.
    fn pending_items(&self) -> Vec<Self::Item>;

    /// Propose `items` at `version`. `false` means "not applied, retry later".
    fn push_remote(&self, version: u64, items: Vec<Self::Item>) -> BoxFuture<'_, bool>;

    /// Fetch everything after `version`. `None` means the call failed.
    fn pull_remote(&self, version: u64) -> BoxFuture<'_, Option<Pulled<Self::Item>>>;

    /// Merge relay-confirmed items and advance the synced version.
    fn apply_local(&self, pulled: Pulled<Self::Item>) -> Result<(), SyncError>;
}

/// Why a push or pull did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    Offline,
    Closed,
    Desynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Skipped(SkipReason),
    /// Nothing pending.
    Idle,
    Accepted(usize),
    NotApplied(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Skipped(SkipReason),
    Applied(usize),
    NotApplied,
}

type DesyncHook = Box<dyn Fn(&'static str, &SyncError) + Send + Sync>;

/// Clears an in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Mutually exclusive push/pull cycles over one [`StreamEndpoint`].
pub struct VersionedStream<E: StreamEndpoint> {
    endpoint: E,
    scheduler: RetryScheduler,
    pushing: AtomicBool,
    pulling: AtomicBool,
    online: AtomicBool,
    closed: AtomicBool,
    attempt: AtomicU32,
    desynced: parking_lot::Mutex<Option<String>>,
    on_desync: Option<DesyncHook>,
}

impl<E: StreamEndpoint> VersionedStream<E> {
    /// A stream that starts online.
    pub fn new(endpoint: E, scheduler: RetryScheduler) -> Self {
        Self {
            endpoint,
            scheduler,
            pushing: AtomicBool::new(false),
            pulling: AtomicBool::new(false),
            online: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            desynced: parking_lot::Mutex::new(None),
            on_desync: None,
        }
    }

    /// Called once when the stream stops syncing because of a conflict.
    pub fn on_desync(mut self, hook: impl Fn(&'static str, &SyncError) + Send + Sync + 'static) -> Self {
        self.on_desync = Some(Box::new(hook));
        self
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn name(&self) -> &'static str {
        self.endpoint.name()
    }

    pub fn version(&self) -> u64 {
        self.endpoint.synced_version()
    }

    pub fn pending_len(&self) -> usize {
        self.endpoint.pending_items().len()
    }

    /// Freeze (`false`) or resume (`true`) syncing.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Stop for good. Pulls that complete afterwards are discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reason the stream stopped syncing, if it did.
    pub fn desync_reason(&self) -> Option<String> {
        self.desynced.lock().clone()
    }

    fn halted(&self) -> Option<SkipReason> {
        if self.closed.load(Ordering::SeqCst) {
            Some(SkipReason::Closed)
        } else if self.desynced.lock().is_some() {
            Some(SkipReason::Desynced)
        } else if !self.online.load(Ordering::SeqCst) {
            Some(SkipReason::Offline)
        } else {
            None
        }
    }

    /// Send pending items. Returns at once if a push is already running.
    pub async fn push(self: &Arc<Self>) -> PushOutcome {
        if let Some(reason) = self.halted() {
            return PushOutcome::Skipped(reason);
        }
        let Some(guard) = InFlight::acquire(&self.pushing) else {
            return PushOutcome::Skipped(SkipReason::InFlight);
        };

        let items = self.endpoint.pending_items();
        if items.is_empty() {
            return PushOutcome::Idle;
        }
        let count = items.len();
        let version = self.endpoint.synced_version();
        let accepted = self.endpoint.push_remote(version, items).await;
        drop(guard);

        if accepted {
            self.attempt.store(0, Ordering::SeqCst);
            log::debug!("{}: pushed {count} items at v{version}", self.name());
        } else {
            self.attempt.fetch_add(1, Ordering::SeqCst);
            log::debug!("{}: push of {count} items at v{version} not applied", self.name());
        }

        if !self.endpoint.pending_items().is_empty() {
            self.schedule_followup();
        }

        if accepted {
            PushOutcome::Accepted(count)
        } else {
            PushOutcome::NotApplied(count)
        }
    }

    /// Pull, then push again after the current backoff delay.
    fn schedule_followup(self: &Arc<Self>) {
        let delay = self
            .scheduler
            .policy()
            .delay(self.attempt.load(Ordering::SeqCst));
        let stream = Arc::clone(self);
        self.scheduler.after(Duration::ZERO, async move {
            // Errors are already reported through the desync hook
            let _ = stream.pull().await;
            tokio::time::sleep(delay).await;
            stream.push().await;
        });
    }

    /// Fetch and apply relay-confirmed items. Dropped if a pull is running.
    ///
    /// Only a conflict is an error; it stops the stream.
    pub async fn pull(&self) -> Result<PullOutcome, SyncError> {
        if let Some(reason) = self.halted() {
            return Ok(PullOutcome::Skipped(reason));
        }
        let Some(_guard) = InFlight::acquire(&self.pulling) else {
            return Ok(PullOutcome::Skipped(SkipReason::InFlight));
        };

        let base = self.endpoint.synced_version();
        let Some(pulled) = self.endpoint.pull_remote(base).await else {
            return Ok(PullOutcome::NotApplied);
        };

        // Torn down while the call was in flight
        if self.closed.load(Ordering::SeqCst) {
            return Ok(PullOutcome::Skipped(SkipReason::Closed));
        }

        let count = pulled.items.len();
        let last_version = pulled.last_version;
        let conflict = SyncError::ApplyConflict {
            stream: self.name(),
            base,
            last_version,
            count,
        };
        if base + count as u64 != last_version {
            return Err(self.poison(conflict));
        }
        if let Err(e) = self.endpoint.apply_local(pulled) {
            return Err(self.poison(e));
        }
        if self.endpoint.synced_version() != last_version {
            return Err(self.poison(conflict));
        }

        if count > 0 {
            log::debug!("{}: applied {count} items, now v{last_version}", self.name());
        }
        Ok(PullOutcome::Applied(count))
    }

    fn poison(&self, error: SyncError) -> SyncError {
        log::error!("{}: {error}; sync stopped", self.name());
        let first = {
            let mut desynced = self.desynced.lock();
            let first = desynced.is_none();
            if first {
                *desynced = Some(error.to_string());
            }
            first
        };
        if first {
            // Pending retries for this stream are pointless now
            self.scheduler.cancel();
            if let Some(hook) = &self.on_desync {
                hook(self.name(), &error);
            }
        }
        error
    }
}
