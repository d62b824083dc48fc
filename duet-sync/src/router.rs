//! Peer message routing.
//!
//! ```text
//!  route(dest, msg)
//!     │
//!     ├─ Local ───────────────────────────┐
//!     ├─ Peer(id) ── id == self? ─────────┤
//!     └─ ShellOwner ── owner_of(shell) ───┤
//!                                         ├─ self ──► LocalDispatch (no network hop)
//!                                         └─ other ─► relay sendToPrivate
//! ```
//!
//! The router keeps no identity of its own: every call carries a
//! [`RouteContext`] with the current peer id and the subscribed shell.

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::{PeerId, PeerMessage};
use crate::shell::ShellRegistry;
use crate::transport::{send_to_peer, Relay};

/// Process Runner collaborator: compiles and runs code, owns processes.
pub trait ProcessRunner: Send + Sync {
    /// Compile and run `source`. Compiler output goes back to `reply_to`.
    fn compile(&self, source: String, reply_to: PeerId);

    /// Write keystrokes to the process behind shell `uuid`.
    fn write_keystroke(&self, uuid: Uuid, text: &str);

    fn kill_process(&self, uuid: Uuid);
}

/// Compiler output pane of this peer.
pub trait CompileOutput: Send + Sync {
    fn append(&self, text: &str);
    fn replace(&self, text: &str);
}

/// Where a message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// This peer.
    Local,
    Peer(PeerId),
    /// Whoever owns the currently subscribed shell.
    ShellOwner,
}

/// Routing inputs that change over a session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteContext {
    pub self_id: Option<PeerId>,
    pub subscribed_shell: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handled in-process.
    Local,
    Sent(PeerId),
    /// The relay did not deliver; the message is dropped.
    NotDelivered(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("No peer identity yet (not connected)")]
    NoIdentity,
    #[error("No shell subscribed")]
    NoSubscribedShell,
    #[error("Owner of shell {0} is unknown")]
    UnknownShellOwner(Uuid),
    #[error("Shell {0} is owned by another peer")]
    NotOwner(Uuid),
}

/// The compile/run this peer is currently serving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Job {
    requester: Option<PeerId>,
    shell: Option<Uuid>,
    /// Source accepted but not handed to the runner yet.
    pending_source: Option<String>,
}

/// Handles messages addressed to this peer.
pub struct LocalDispatch {
    runner: Arc<dyn ProcessRunner>,
    output: Arc<dyn CompileOutput>,
    shells: Arc<ShellRegistry>,
    job: Mutex<Job>,
}

impl LocalDispatch {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        output: Arc<dyn CompileOutput>,
        shells: Arc<ShellRegistry>,
    ) -> Self {
        Self {
            runner,
            output,
            shells,
            job: Mutex::new(Job::default()),
        }
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    /// Peer waiting for output of the running compile.
    pub fn compile_requester(&self) -> Option<PeerId> {
        self.job.lock().requester
    }

    /// End the running compile, returning whoever asked for it.
    pub fn finish_compile(&self) -> Option<PeerId> {
        self.job.lock().requester.take()
    }

    /// Route further process output of the current job to shell `uuid`.
    pub fn attach_shell(&self, uuid: Uuid) {
        self.job.lock().shell = Some(uuid);
    }

    /// Shell receiving the current job's process output.
    pub fn current_shell(&self) -> Option<Uuid> {
        self.job.lock().shell
    }

    /// Hand an accepted compile request to the runner.
    ///
    /// Call after the requester's pane reset has been routed, so output the
    /// runner emits right away lands after it.
    pub fn start_compile(&self) {
        let (source, requester) = {
            let mut job = self.job.lock();
            match (job.pending_source.take(), job.requester) {
                (Some(source), Some(requester)) => (source, requester),
                _ => return,
            }
        };
        self.runner.compile(source, requester);
    }

    /// Handle `message` from `from`. May return a reply to route back.
    ///
    /// A compile request only records the job; [`start_compile`](Self::start_compile)
    /// runs it.
    pub fn dispatch(
        &self,
        self_id: PeerId,
        from: PeerId,
        message: PeerMessage,
    ) -> Option<(PeerId, PeerMessage)> {
        match message {
            PeerMessage::CompileRequest { source } => {
                log::info!("Compile requested by {from} ({} bytes)", source.len());
                *self.job.lock() = Job {
                    requester: Some(from),
                    shell: None,
                    pending_source: Some(source),
                };
                // Clear the requester's pane for the new run
                Some((from, PeerMessage::CompileReplace { text: String::new() }))
            }
            PeerMessage::CompileAppend { text } => {
                self.output.append(&text);
                None
            }
            PeerMessage::CompileReplace { text } => {
                self.output.replace(&text);
                None
            }
            PeerMessage::ShellKeystroke { uuid, text } => {
                if self.shells.owner_of(uuid) == Some(self_id) {
                    self.runner.write_keystroke(uuid, &text);
                } else {
                    log::warn!("Keystrokes from {from} for shell {uuid} not owned here");
                }
                None
            }
        }
    }
}

/// Resolves destinations and delivers peer messages.
pub struct PeerRouter {
    relay: Arc<dyn Relay>,
    shells: Arc<ShellRegistry>,
    local: LocalDispatch,
}

impl PeerRouter {
    pub fn new(relay: Arc<dyn Relay>, shells: Arc<ShellRegistry>, local: LocalDispatch) -> Self {
        Self {
            relay,
            shells,
            local,
        }
    }

    pub fn local(&self) -> &LocalDispatch {
        &self.local
    }

    /// Peer that `dest` denotes right now.
    pub fn resolve(&self, ctx: &RouteContext, dest: Destination) -> Result<PeerId, RouteError> {
        let self_id = ctx.self_id.ok_or(RouteError::NoIdentity)?;
        match dest {
            Destination::Local => Ok(self_id),
            Destination::Peer(peer) => Ok(peer),
            Destination::ShellOwner => {
                let shell = ctx.subscribed_shell.ok_or(RouteError::NoSubscribedShell)?;
                self.shells
                    .owner_of(shell)
                    .ok_or(RouteError::UnknownShellOwner(shell))
            }
        }
    }

    pub async fn route(
        &self,
        ctx: &RouteContext,
        dest: Destination,
        message: PeerMessage,
    ) -> Result<RouteOutcome, RouteError> {
        let self_id = ctx.self_id.ok_or(RouteError::NoIdentity)?;
        let target = self.resolve(ctx, dest)?;
        if target == self_id {
            self.deliver(self_id, self_id, message).await;
            return Ok(RouteOutcome::Local);
        }
        Ok(self.send(target, &message).await)
    }

    /// Handle a message that arrived from `from` through the relay.
    pub async fn receive(&self, ctx: &RouteContext, from: PeerId, message: PeerMessage) {
        let Some(self_id) = ctx.self_id else {
            log::warn!("Dropping {} from {from}: no identity yet", message.kind());
            return;
        };
        self.deliver(self_id, from, message).await;
    }

    async fn deliver(&self, self_id: PeerId, from: PeerId, message: PeerMessage) {
        if let Some((to, reply)) = self.local.dispatch(self_id, from, message) {
            if to == self_id {
                // Replies to compile requests never produce further replies
                let _ = self.local.dispatch(self_id, self_id, reply);
            } else {
                self.send(to, &reply).await;
            }
        }
        self.local.start_compile();
    }

    async fn send(&self, target: PeerId, message: &PeerMessage) -> RouteOutcome {
        if send_to_peer(self.relay.as_ref(), target, message).await {
            RouteOutcome::Sent(target)
        } else {
            log::warn!("{} to {target} was not delivered", message.kind());
            RouteOutcome::NotDelivered(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayEvent;
    use crate::transport::MemoryHub;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
    }

    impl ProcessRunner for RecordingRunner {
        fn compile(&self, source: String, reply_to: PeerId) {
            self.calls.lock().push(format!("compile {source} -> {reply_to}"));
        }

        fn write_keystroke(&self, uuid: Uuid, text: &str) {
            self.calls.lock().push(format!("keys {uuid} {text}"));
        }

        fn kill_process(&self, uuid: Uuid) {
            self.calls.lock().push(format!("kill {uuid}"));
        }
    }

    #[derive(Default)]
    struct Pane {
        text: Mutex<String>,
    }

    impl CompileOutput for Pane {
        fn append(&self, text: &str) {
            self.text.lock().push_str(text);
        }

        fn replace(&self, text: &str) {
            *self.text.lock() = text.to_string();
        }
    }

    struct Fixture {
        router: PeerRouter,
        runner: Arc<RecordingRunner>,
        pane: Arc<Pane>,
        shells: Arc<ShellRegistry>,
    }

    fn fixture(relay: Arc<dyn Relay>) -> Fixture {
        let runner = Arc::new(RecordingRunner::default());
        let pane = Arc::new(Pane::default());
        let shells = Arc::new(ShellRegistry::new());
        let local = LocalDispatch::new(runner.clone(), pane.clone(), shells.clone());
        Fixture {
            router: PeerRouter::new(relay, shells.clone(), local),
            runner,
            pane,
            shells,
        }
    }

    #[tokio::test]
    async fn test_route_to_self_is_local() {
        let hub = MemoryHub::new();
        let relay: Arc<dyn Relay> = Arc::new(hub.transport("room", "Alice"));
        let f = fixture(relay);
        let me = Uuid::new_v4();
        let ctx = RouteContext { self_id: Some(me), subscribed_shell: None };

        let outcome = f
            .router
            .route(&ctx, Destination::Local, PeerMessage::CompileRequest { source: "x".into() })
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Local);
        assert_eq!(f.runner.calls.lock().as_slice(), [format!("compile x -> {me}")]);
        assert_eq!(f.router.local().compile_requester(), Some(me));

        f.router
            .route(&ctx, Destination::Peer(me), PeerMessage::CompileAppend { text: "warn".into() })
            .await
            .unwrap();
        assert_eq!(*f.pane.text.lock(), "warn");
    }

    #[tokio::test]
    async fn test_route_without_identity_fails() {
        let hub = MemoryHub::new();
        let f = fixture(Arc::new(hub.transport("room", "Alice")));
        let err = f
            .router
            .route(&RouteContext::default(), Destination::Local, PeerMessage::CompileAppend { text: String::new() })
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::NoIdentity);
    }

    #[tokio::test]
    async fn test_shell_owner_resolution() {
        let hub = MemoryHub::new();
        let f = fixture(Arc::new(hub.transport("room", "Alice")));
        let (me, owner, shell) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let ctx = RouteContext { self_id: Some(me), subscribed_shell: None };
        assert_eq!(f.router.resolve(&ctx, Destination::ShellOwner), Err(RouteError::NoSubscribedShell));

        let ctx = RouteContext { self_id: Some(me), subscribed_shell: Some(shell) };
        assert_eq!(
            f.router.resolve(&ctx, Destination::ShellOwner),
            Err(RouteError::UnknownShellOwner(shell))
        );

        f.shells.apply_remote(vec![crate::protocol::ShellUpdate::Spawn { uuid: shell, spawner: owner }]);
        assert_eq!(f.router.resolve(&ctx, Destination::ShellOwner), Ok(owner));
    }

    #[tokio::test]
    async fn test_keystroke_only_for_owned_shell() {
        let hub = MemoryHub::new();
        let f = fixture(Arc::new(hub.transport("room", "Alice")));
        let (me, other, shell) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let ctx = RouteContext { self_id: Some(me), subscribed_shell: Some(shell) };

        f.shells.apply_remote(vec![crate::protocol::ShellUpdate::Spawn { uuid: shell, spawner: other }]);
        f.router
            .receive(&ctx, other, PeerMessage::ShellKeystroke { uuid: shell, text: "ls\r".into() })
            .await;
        assert!(f.runner.calls.lock().is_empty());

        f.shells.spawn(shell, me);
        f.router
            .receive(&ctx, other, PeerMessage::ShellKeystroke { uuid: shell, text: "ls\r".into() })
            .await;
        assert_eq!(f.runner.calls.lock().as_slice(), [format!("keys {shell} ls\r")]);
    }

    #[tokio::test]
    async fn test_keystrokes_relayed_to_shell_owner() {
        let hub = MemoryHub::new();
        let viewer = Arc::new(hub.transport("room", "Viewer"));
        let owner = Arc::new(hub.transport("room", "Owner"));
        viewer.connect().await.unwrap();
        owner.connect().await.unwrap();
        let mut owner_events = owner.subscribe();

        let f = fixture(viewer.clone());
        let shell = Uuid::new_v4();
        f.shells.apply_remote(vec![crate::protocol::ShellUpdate::Spawn {
            uuid: shell,
            spawner: owner.peer_id(),
        }]);
        let ctx = RouteContext { self_id: Some(viewer.peer_id()), subscribed_shell: Some(shell) };

        let message = PeerMessage::ShellKeystroke { uuid: shell, text: "q".into() };
        let outcome = f
            .router
            .route(&ctx, Destination::ShellOwner, message.clone())
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Sent(owner.peer_id()));

        loop {
            match owner_events.recv().await.unwrap() {
                RelayEvent::Message { from, message: body, .. } => {
                    assert_eq!(from, viewer.peer_id());
                    assert_eq!(PeerMessage::decode(&body).unwrap(), message);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_not_delivered() {
        let hub = MemoryHub::new();
        let relay = Arc::new(hub.transport("room", "Alice"));
        relay.connect().await.unwrap();
        let f = fixture(relay.clone());
        let ctx = RouteContext { self_id: Some(relay.peer_id()), subscribed_shell: None };
        let stranger = Uuid::new_v4();

        let outcome = f
            .router
            .route(&ctx, Destination::Peer(stranger), PeerMessage::CompileAppend { text: "x".into() })
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::NotDelivered(stranger));
    }

    /// Runner that writes to the pane as soon as a compile starts.
    struct EagerRunner {
        pane: Arc<Pane>,
    }

    impl ProcessRunner for EagerRunner {
        fn compile(&self, _source: String, _reply_to: PeerId) {
            self.pane.append("compiling\n");
        }

        fn write_keystroke(&self, _uuid: Uuid, _text: &str) {}

        fn kill_process(&self, _uuid: Uuid) {}
    }

    #[tokio::test]
    async fn test_pane_reset_precedes_early_output() {
        let hub = MemoryHub::new();
        let pane = Arc::new(Pane::default());
        pane.append("old run\n");
        let shells = Arc::new(ShellRegistry::new());
        let local = LocalDispatch::new(Arc::new(EagerRunner { pane: pane.clone() }), pane.clone(), shells.clone());
        let router = PeerRouter::new(Arc::new(hub.transport("room", "Alice")), shells, local);
        let ctx = RouteContext { self_id: Some(Uuid::new_v4()), subscribed_shell: None };

        router
            .route(&ctx, Destination::Local, PeerMessage::CompileRequest { source: "x".into() })
            .await
            .unwrap();
        assert_eq!(*pane.text.lock(), "compiling\n");
    }

    /// Runner that records whether the requester already had the pane
    /// reset queued when the compile started.
    struct OrderRunner {
        requester: PeerId,
        requester_events: Mutex<tokio::sync::broadcast::Receiver<Arc<crate::relay::RoomEvent>>>,
        reset_first: Mutex<Option<bool>>,
    }

    impl ProcessRunner for OrderRunner {
        fn compile(&self, _source: String, _reply_to: PeerId) {
            let mut events = self.requester_events.lock();
            let mut seen = false;
            while let Ok(room_event) = events.try_recv() {
                if !room_event.is_for(self.requester) {
                    continue;
                }
                if let RelayEvent::Message { message, .. } = &room_event.event {
                    seen |= matches!(PeerMessage::decode(message), Ok(PeerMessage::CompileReplace { .. }));
                }
            }
            *self.reset_first.lock() = Some(seen);
        }

        fn write_keystroke(&self, _uuid: Uuid, _text: &str) {}

        fn kill_process(&self, _uuid: Uuid) {}
    }

    #[tokio::test]
    async fn test_remote_pane_reset_sent_before_compile() {
        let hub = MemoryHub::new();
        let requester = Uuid::new_v4();
        let (_seat, requester_events) = hub.hub().join(requester, "room", "Alice").await.unwrap();
        let server = Arc::new(hub.transport("room", "Bob"));
        server.connect().await.unwrap();

        let runner = Arc::new(OrderRunner {
            requester,
            requester_events: Mutex::new(requester_events),
            reset_first: Mutex::new(None),
        });
        let shells = Arc::new(ShellRegistry::new());
        let local = LocalDispatch::new(runner.clone(), Arc::new(Pane::default()), shells.clone());
        let router = PeerRouter::new(server.clone(), shells, local);
        let ctx = RouteContext { self_id: Some(server.peer_id()), subscribed_shell: None };

        router
            .receive(&ctx, requester, PeerMessage::CompileRequest { source: "x".into() })
            .await;
        assert_eq!(*runner.reset_first.lock(), Some(true));
        assert_eq!(router.local().compile_requester(), Some(requester));
    }
}
