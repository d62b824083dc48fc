//! One peer's membership in a shared room.
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────► Connecting
//!       ▲                          │ relay Open
//!       │ relay Close              ▼
//!       ├─────────────────────── Syncing ── peers, pull doc + shells
//!       │                          │
//!       │                          ▼
//!       └─────────────────────── Ready ──── push on local change,
//!                                           pull on newUpdates
//! ```
//!
//! A [`Session`] owns three background tasks:
//!
//! - the relay event loop (state machine, pulls, peer messages)
//! - the local loop (push on edits, viewer events)
//! - the outbox (process output routed back to compile requesters, in order)
//!
//! All of them stop when the session is left or dropped. Retries run on the
//! session's [`RetryScheduler`] and stop with it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::document::{DocumentChange, DocumentEndpoint, SharedDocument};
use crate::error::SyncError;
use crate::peers::{Peer, PeerDirectory};
use crate::protocol::{PeerId, PeerMessage, RelayEvent, PEER_CHANNEL};
use crate::router::{
    CompileOutput, Destination, LocalDispatch, PeerRouter, ProcessRunner, RouteContext,
    RouteError, RouteOutcome,
};
use crate::scheduler::RetryScheduler;
use crate::shell::{ShellEndpoint, ShellEvent, ShellRegistry};
use crate::stream::VersionedStream;
use crate::transport::Relay;

/// Connection state as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected; catching up with the relay
    Syncing,
    Ready,
}

/// Events for viewers of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    PeersChanged,
    /// Changes from other peers were applied to the document
    DocumentChanged { version: u64 },
    ShellSpawned { uuid: Uuid, owner: PeerId },
    ShellOutput { uuid: Uuid, index: usize, data: String },
    /// A stream stopped syncing after an unrecoverable error
    Desynced { stream: &'static str, reason: String },
}

type Outgoing = (PeerId, PeerMessage);

struct SessionCore {
    relay: Arc<dyn Relay>,
    state: watch::Sender<ConnectionState>,
    document: Arc<SharedDocument>,
    shells: Arc<ShellRegistry>,
    doc_stream: Arc<VersionedStream<DocumentEndpoint>>,
    shell_stream: Arc<VersionedStream<ShellEndpoint>>,
    router: PeerRouter,
    peers: PeerDirectory,
    subscribed_shell: RwLock<Option<Uuid>>,
    events: broadcast::Sender<SessionEvent>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    scheduler: RetryScheduler,
}

impl SessionCore {
    fn context(&self) -> RouteContext {
        RouteContext {
            self_id: self.peers.self_id(),
            subscribed_shell: *self.subscribed_shell.read(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No viewers is fine
        let _ = self.events.send(event);
    }

    /// Move to `next`. Returns whether the state changed.
    fn set_state(&self, next: ConnectionState) -> bool {
        self.transition(|_| Some(next))
    }

    fn transition(&self, step: impl FnOnce(ConnectionState) -> Option<ConnectionState>) -> bool {
        let mut entered = None;
        self.state.send_if_modified(|state| match step(*state) {
            Some(next) if next != *state => {
                log::debug!("Session state {:?} -> {:?}", *state, next);
                *state = next;
                entered = Some(next);
                true
            }
            _ => false,
        });
        match entered {
            Some(next) => {
                self.emit(SessionEvent::StateChanged(next));
                true
            }
            None => false,
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn on_open(&self) {
        let began = self.transition(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Some(ConnectionState::Syncing)
            }
            _ => None,
        });
        if !began {
            return;
        }

        if self.peers.refresh(self.relay.as_ref()).await {
            self.emit(SessionEvent::PeersChanged);
        }
        self.doc_stream.set_online(true);
        self.shell_stream.set_online(true);
        self.pull_all().await;

        if !self.relay.is_ready() {
            // The Close event that follows moves us to Disconnected
            log::debug!("Relay closed while syncing");
            return;
        }
        if self.set_state(ConnectionState::Ready) {
            log::info!(
                "Session ready (doc v{}, shells v{})",
                self.doc_stream.version(),
                self.shell_stream.version()
            );
        }
        self.schedule_push();
    }

    fn on_close(&self) {
        self.doc_stream.set_online(false);
        self.shell_stream.set_online(false);
        // A Close left over from before a reconnect must not undo Connecting
        let closed = self.transition(|state| match state {
            ConnectionState::Syncing | ConnectionState::Ready => Some(ConnectionState::Disconnected),
            _ => None,
        });
        if closed {
            log::info!("Session disconnected");
            if !self.peers.is_empty() {
                self.peers.clear();
                self.emit(SessionEvent::PeersChanged);
            }
        }
    }

    async fn on_message(&self, from: PeerId, channel: &str, message: &str) {
        if channel != PEER_CHANNEL {
            log::debug!("Ignoring message from {from} on channel '{channel}'");
            return;
        }
        match PeerMessage::decode(message) {
            Ok(message) => self.router.receive(&self.context(), from, message).await,
            Err(e) => log::warn!("Dropping undecodable message from {from}: {e}"),
        }
    }

    async fn refresh_peers(&self) {
        if self.peers.refresh(self.relay.as_ref()).await {
            self.emit(SessionEvent::PeersChanged);
        }
    }

    async fn pull_all(&self) {
        // Failures are surfaced through the desync hook
        if let Err(e) = self.doc_stream.pull().await {
            log::debug!("Document pull failed: {e}");
        }
        if let Err(e) = self.shell_stream.pull().await {
            log::debug!("Shell pull failed: {e}");
        }
    }

    fn schedule_pull(self: &Arc<Self>) {
        let core = Arc::clone(self);
        self.scheduler.after(Duration::ZERO, async move {
            core.pull_all().await;
        });
    }

    fn schedule_push(&self) {
        let doc_stream = Arc::clone(&self.doc_stream);
        let shell_stream = Arc::clone(&self.shell_stream);
        self.scheduler.after(Duration::ZERO, async move {
            doc_stream.push().await;
            shell_stream.push().await;
        });
    }
}

// ─── Background tasks ─────────────────────────────────────────

async fn run_relay_events(core: Arc<SessionCore>, mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(RelayEvent::Open) => core.on_open().await,
            Ok(RelayEvent::Close) => core.on_close(),
            Ok(RelayEvent::NewUpdates) => core.schedule_pull(),
            Ok(RelayEvent::NewPeers) => core.refresh_peers().await,
            Ok(RelayEvent::Message {
                from,
                channel,
                message,
            }) => core.on_message(from, &channel, &message).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Session missed {missed} relay events, resyncing");
                if core.relay.is_ready() {
                    core.on_open().await;
                    core.refresh_peers().await;
                    core.schedule_pull();
                } else {
                    core.on_close();
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_local(
    core: Arc<SessionCore>,
    mut doc_events: broadcast::Receiver<DocumentChange>,
    mut shell_events: broadcast::Receiver<ShellEvent>,
) {
    loop {
        tokio::select! {
            _ = core.document.changed() => {
                let stream = Arc::clone(&core.doc_stream);
                core.scheduler.after(Duration::ZERO, async move {
                    stream.push().await;
                });
            }
            _ = core.shells.changed() => {
                let stream = Arc::clone(&core.shell_stream);
                core.scheduler.after(Duration::ZERO, async move {
                    stream.push().await;
                });
            }
            change = doc_events.recv() => match change {
                Ok(DocumentChange::Remote { version }) => {
                    core.emit(SessionEvent::DocumentChanged { version });
                }
                Ok(DocumentChange::Local) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    core.emit(SessionEvent::DocumentChanged {
                        version: core.document.version(),
                    });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = shell_events.recv() => match event {
                Ok(ShellEvent::Spawned { uuid, owner }) => {
                    core.emit(SessionEvent::ShellSpawned { uuid, owner });
                }
                Ok(ShellEvent::Output { uuid, index, data }) => {
                    core.emit(SessionEvent::ShellOutput { uuid, index, data });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Viewers missed {missed} shell events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn run_outbox(core: Arc<SessionCore>, mut outbox: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some((to, message)) = outbox.recv().await {
        match core
            .router
            .route(&core.context(), Destination::Peer(to), message)
            .await
        {
            Ok(RouteOutcome::NotDelivered(peer)) => {
                log::warn!("Compile output for {peer} was not delivered");
            }
            Ok(_) => {}
            Err(e) => log::warn!("Compile output not routed: {e}"),
        }
    }
}

// ─── Session ──────────────────────────────────────────────────

/// A peer's live view of a room: document, shells, peers, and routing.
///
/// Must be created inside a Tokio runtime.
pub struct Session {
    core: Arc<SessionCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Build a disconnected session on top of `relay`.
    pub fn new(
        config: &SyncConfig,
        relay: Arc<dyn Relay>,
        runner: Arc<dyn ProcessRunner>,
        output: Arc<dyn CompileOutput>,
    ) -> Self {
        let scheduler = RetryScheduler::new(config.backoff());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        let document = Arc::new(SharedDocument::with_event_capacity(config.event_capacity));
        let shells = Arc::new(ShellRegistry::with_event_capacity(config.event_capacity));

        let desync_events = events.clone();
        let doc_stream = VersionedStream::new(
            DocumentEndpoint::new(Arc::clone(&document), Arc::clone(&relay), &config.doc_name),
            scheduler.child(),
        )
        .on_desync(move |stream, error| {
            let _ = desync_events.send(SessionEvent::Desynced {
                stream,
                reason: error.to_string(),
            });
        });
        let desync_events = events.clone();
        let shell_stream = VersionedStream::new(
            ShellEndpoint::new(Arc::clone(&shells), Arc::clone(&relay), &config.doc_name),
            scheduler.child(),
        )
        .on_desync(move |stream, error| {
            let _ = desync_events.send(SessionEvent::Desynced {
                stream,
                reason: error.to_string(),
            });
        });
        doc_stream.set_online(false);
        shell_stream.set_online(false);

        let router = PeerRouter::new(
            Arc::clone(&relay),
            Arc::clone(&shells),
            LocalDispatch::new(runner, output, Arc::clone(&shells)),
        );

        // Subscribe before anything can emit
        let relay_events = relay.subscribe();
        let doc_events = document.subscribe();
        let shell_events = shells.subscribe();

        let core = Arc::new(SessionCore {
            relay,
            state,
            document,
            shells,
            doc_stream: Arc::new(doc_stream),
            shell_stream: Arc::new(shell_stream),
            router,
            peers: PeerDirectory::new(),
            subscribed_shell: RwLock::new(None),
            events,
            outbox,
            scheduler,
        });

        let tasks = vec![
            tokio::spawn(run_relay_events(Arc::clone(&core), relay_events)),
            tokio::spawn(run_local(Arc::clone(&core), doc_events, shell_events)),
            tokio::spawn(run_outbox(Arc::clone(&core), outbox_rx)),
        ];

        Self {
            core,
            tasks: Mutex::new(tasks),
        }
    }

    /// Create a session and connect it, waiting until it is ready.
    pub async fn join(
        config: &SyncConfig,
        relay: Arc<dyn Relay>,
        runner: Arc<dyn ProcessRunner>,
        output: Arc<dyn CompileOutput>,
    ) -> Result<Self, SyncError> {
        let session = Self::new(config, relay, runner, output);
        session.connect().await?;
        Ok(session)
    }

    /// Connect to the relay and wait until the session is ready.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if self.core.scheduler.is_cancelled() {
            return Err(SyncError::Closed);
        }
        if !self.core.relay.is_ready() {
            self.core.transition(|state| match state {
                ConnectionState::Disconnected => Some(ConnectionState::Connecting),
                _ => None,
            });
            if let Err(e) = self.core.relay.connect().await {
                log::warn!("Connecting to relay failed: {e}");
                self.core.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        }
        self.ready().await
    }

    /// Reconnect after [`Session::go_offline`] or a dropped connection.
    /// Does nothing when already connected.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.connect().await
    }

    /// Wait until the session is ready. Fails if it ends up disconnected.
    pub async fn ready(&self) -> Result<(), SyncError> {
        let mut state = self.core.state.subscribe();
        let reached = *state
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Disconnected))
            .await
            .map_err(|_| SyncError::Closed)?;
        match reached {
            ConnectionState::Ready => Ok(()),
            _ => Err(SyncError::NotConnected),
        }
    }

    /// Drop the relay connection but keep all local state. Edits made while
    /// offline are pushed after [`Session::reconnect`].
    pub async fn go_offline(&self) {
        self.core.relay.disconnect().await;
        self.core.on_close();
    }

    /// Leave the room for good: stop all tasks and retries.
    pub async fn leave(&self) {
        self.shutdown();
        self.core.relay.disconnect().await;
        self.core.on_close();
        self.core.set_state(ConnectionState::Disconnected);
    }

    fn shutdown(&self) {
        self.core.scheduler.cancel();
        self.core.doc_stream.close();
        self.core.shell_stream.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.core.document
    }

    pub fn shells(&self) -> &Arc<ShellRegistry> {
        &self.core.shells
    }

    pub fn state(&self) -> ConnectionState {
        self.core.current_state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Own peer id on the current (or last) connection.
    pub fn self_id(&self) -> Option<PeerId> {
        self.core.peers.self_id()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.core.peers.list()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Document and shell stream versions.
    pub fn versions(&self) -> (u64, u64) {
        (self.core.doc_stream.version(), self.core.shell_stream.version())
    }

    /// Reason the session stopped syncing, if it did.
    pub fn desync_reason(&self) -> Option<String> {
        self.core
            .doc_stream
            .desync_reason()
            .or_else(|| self.core.shell_stream.desync_reason())
    }

    /// Follow shell `uuid` in the shell pane; keystrokes go to its owner.
    pub fn subscribe_shell(&self, uuid: Uuid) {
        *self.core.subscribed_shell.write() = Some(uuid);
    }

    pub fn unsubscribe_shell(&self) {
        *self.core.subscribed_shell.write() = None;
    }

    pub fn subscribed_shell(&self) -> Option<Uuid> {
        *self.core.subscribed_shell.read()
    }

    /// Send keystrokes to the process behind the subscribed shell.
    pub async fn send_keystroke(&self, text: &str) -> Result<RouteOutcome, SyncError> {
        let uuid = self
            .subscribed_shell()
            .ok_or(RouteError::NoSubscribedShell)?;
        let message = PeerMessage::ShellKeystroke {
            uuid,
            text: text.to_string(),
        };
        Ok(self
            .core
            .router
            .route(&self.core.context(), Destination::ShellOwner, message)
            .await?)
    }

    /// Ask `dest` to compile and run the current document.
    pub async fn request_compile(&self, dest: Destination) -> Result<RouteOutcome, SyncError> {
        let message = PeerMessage::CompileRequest {
            source: self.core.document.text(),
        };
        Ok(self
            .core
            .router
            .route(&self.core.context(), dest, message)
            .await?)
    }

    /// Kill the process behind a shell this peer owns.
    pub fn kill_shell(&self, uuid: Uuid) -> Result<(), SyncError> {
        let owner = self
            .core
            .shells
            .owner_of(uuid)
            .ok_or(SyncError::UnknownShell(uuid))?;
        if Some(owner) != self.self_id() {
            return Err(RouteError::NotOwner(uuid).into());
        }
        self.core.router.local().runner().kill_process(uuid);
        Ok(())
    }

    /// Pull, then push, both streams right now.
    pub async fn sync_now(&self) -> Result<(), SyncError> {
        if self.state() != ConnectionState::Ready {
            return Err(SyncError::NotConnected);
        }
        self.core.doc_stream.pull().await?;
        self.core.shell_stream.pull().await?;
        self.core.doc_stream.push().await;
        self.core.shell_stream.push().await;
        Ok(())
    }

    /// Handle for the Process Runner.
    pub fn host(&self) -> ShellHost {
        ShellHost {
            core: Arc::downgrade(&self.core),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Shell host ───────────────────────────────────────────────

/// Entry points for the Process Runner on the peer that runs code.
///
/// Safe to call from any thread. Calls after the session is gone are
/// ignored (or fail with [`SyncError::Closed`]).
#[derive(Clone)]
pub struct ShellHost {
    core: Weak<SessionCore>,
}

impl ShellHost {
    fn core(&self) -> Result<Arc<SessionCore>, SyncError> {
        self.core.upgrade().ok_or(SyncError::Closed)
    }

    /// Start a shell owned by this peer for the running process. Its
    /// output from now on goes to the shell.
    pub fn spawn_process_output_uuid(&self) -> Result<Uuid, SyncError> {
        let core = self.core()?;
        let owner = core.peers.self_id().ok_or(SyncError::NotConnected)?;
        let uuid = Uuid::new_v4();
        core.shells.spawn(uuid, owner);
        core.router.local().attach_shell(uuid);
        log::info!("Spawned shell {uuid}");
        Ok(uuid)
    }

    /// One chunk of process output: into the current shell if one was
    /// spawned, otherwise to whoever requested the compile.
    pub fn on_process_output(&self, data: &str) {
        let Ok(core) = self.core() else {
            return;
        };
        let local = core.router.local();
        if let Some(uuid) = local.current_shell() {
            if let Err(e) = core.shells.append_output(uuid, data) {
                log::warn!("Dropping process output: {e}");
            }
        } else if let Some(requester) = local.compile_requester() {
            let message = PeerMessage::CompileAppend {
                text: data.to_string(),
            };
            if core.outbox.send((requester, message)).is_err() {
                log::debug!("Session gone, dropping compile output");
            }
        } else {
            log::warn!("Process output with no shell and no requester");
        }
    }

    /// The compiler finished. Non-zero exit codes are reported to the
    /// requester.
    pub fn on_compile_exit(&self, exit_code: i32) {
        let Ok(core) = self.core() else {
            return;
        };
        let requester = core.router.local().finish_compile();
        log::info!("Compiler exited with code {exit_code}");
        if exit_code == 0 {
            return;
        }
        if let Some(requester) = requester {
            let message = PeerMessage::CompileAppend {
                text: format!("compiler exited with code {exit_code}\n"),
            };
            if core.outbox.send((requester, message)).is_err() {
                log::debug!("Session gone, dropping compile exit");
            }
        }
    }
}
