//! Integration tests for end-to-end sync over WebSocket.
//!
//! These tests start a real relay server and connect real sessions,
//! verifying the full pipeline from edit to remote document.

use std::sync::Arc;

use duet_sync::protocol::ShellUpdate;
use duet_sync::relay::{RelayHub, RelayServer, ServerConfig};
use duet_sync::router::{CompileOutput, Destination, ProcessRunner, RouteOutcome};
use duet_sync::session::{ConnectionState, Session, SessionEvent};
use duet_sync::transport::{Relay, TransportError, WsTransport};
use duet_sync::{PeerId, SyncConfig, SyncError};
use parking_lot::Mutex;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

#[derive(Default)]
struct Runner {
    compiled: Mutex<Vec<String>>,
}

impl ProcessRunner for Runner {
    fn compile(&self, source: String, _reply_to: PeerId) {
        self.compiled.lock().push(source);
    }

    fn write_keystroke(&self, _uuid: Uuid, _text: &str) {}

    fn kill_process(&self, _uuid: Uuid) {}
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

/// Start a relay on a free port, return its URL and hub.
async fn start_test_relay(max_peers_per_room: usize) -> (String, Arc<RelayHub>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = RelayServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_peers_per_room,
        broadcast_capacity: 64,
    });
    let hub = server.hub().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://127.0.0.1:{port}"), hub)
}

fn config(url: &str, name: &str) -> SyncConfig {
    SyncConfig {
        relay_url: url.to_string(),
        call_timeout_ms: 2_000,
        retry_base_ms: 20,
        retry_max_ms: 200,
        ..SyncConfig::for_room("integration-room", name)
    }
}

async fn join(url: &str, name: &str) -> (Session, Arc<Runner>, Arc<Pane>) {
    let config = config(url, name);
    let relay = Arc::new(WsTransport::new(&config));
    let runner = Arc::new(Runner::default());
    let pane = Arc::new(Pane::default());
    let session = Session::join(&config, relay, runner.clone(), pane.clone())
        .await
        .unwrap();
    (session, runner, pane)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_session_joins_relay() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;

    assert_eq!(alice.state(), ConnectionState::Ready);
    assert!(alice.self_id().is_some());
    let peers = alice.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "Alice");
}

#[tokio::test]
async fn test_peer_list_follows_joins() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;
    let mut events = alice.subscribe_events();

    let (bob, _, _) = join(&url, "Bob").await;
    let changed = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SessionEvent::PeersChanged) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(changed.is_ok(), "Alice should see Bob join");
    let names: Vec<String> = alice.peers().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["Alice".to_string(), "Bob".to_string()]);

    bob.leave().await;
    eventually(|| alice.peers().len() == 1).await;
}

#[tokio::test]
async fn test_edits_converge_over_websocket() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;
    let (bob, _, _) = join(&url, "Bob").await;

    alice.document().insert(0, "let x = 1;\n").unwrap();
    eventually(|| bob.document().text() == "let x = 1;\n").await;

    bob.document().insert(bob.document().len(), "let y = 2;\n").unwrap();
    alice.document().insert(0, "// header\n").unwrap();

    let expected = "// header\nlet x = 1;\nlet y = 2;\n";
    eventually(|| alice.document().text() == expected && bob.document().text() == expected).await;
    eventually(|| {
        alice.document().unconfirmed_len() == 0 && bob.document().unconfirmed_len() == 0
    })
    .await;
    assert_eq!(alice.document().version(), bob.document().version());
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;
    alice.document().set_text("fn main() {}\n");
    eventually(|| alice.document().unconfirmed_len() == 0).await;

    let (carol, _, _) = join(&url, "Carol").await;
    // Session::join returns once the initial pull has been applied
    assert_eq!(carol.document().text(), "fn main() {}\n");
}

#[tokio::test]
async fn test_shell_output_reaches_viewer() {
    let (url, hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;
    let (bob, _, _) = join(&url, "Bob").await;

    let host = alice.host();
    let uuid = host.spawn_process_output_uuid().unwrap();
    host.on_process_output("hello\n");
    host.on_process_output("world\n");

    eventually(|| bob.shells().session(uuid).map(|s| s.text()) == Some("hello\nworld\n".to_string()))
        .await;
    assert_eq!(bob.shells().owner_of(uuid), alice.self_id());
    eventually(|| alice.shells().queue_len() == 0).await;

    let room = hub.rooms().get("integration-room").await.unwrap();
    let log = room.with_log(|log| log.shell_log().to_vec());
    assert_eq!(log.len(), 3);
    assert!(matches!(log[0], ShellUpdate::Spawn { .. }));
}

#[tokio::test]
async fn test_remote_compile_request() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, alice_pane) = join(&url, "Alice").await;
    let (bob, bob_runner, _) = join(&url, "Bob").await;

    alice.document().insert(0, "print('hi')").unwrap();
    let bob_id = bob.self_id().unwrap();
    let outcome = alice.request_compile(Destination::Peer(bob_id)).await.unwrap();
    assert_eq!(outcome, RouteOutcome::Sent(bob_id));

    eventually(|| bob_runner.compiled.lock().len() == 1).await;
    assert_eq!(bob_runner.compiled.lock()[0], "print('hi')");

    let host = bob.host();
    host.on_process_output("Traceback\n");
    host.on_compile_exit(2);
    eventually(|| *alice_pane.text.lock() == "Traceback\ncompiler exited with code 2\n").await;
}

#[tokio::test]
async fn test_room_full_is_rejected() {
    let (url, _hub) = start_test_relay(1).await;
    let (_alice, _, _) = join(&url, "Alice").await;

    let config = config(&url, "Bob");
    let relay = Arc::new(WsTransport::new(&config));
    let result = Session::join(
        &config,
        relay.clone(),
        Arc::new(Runner::default()),
        Arc::new(Pane::default()),
    )
    .await;
    assert!(matches!(
        result,
        Err(SyncError::Transport(TransportError::Rejected(_)))
    ));
    assert!(!relay.is_ready());
}

#[tokio::test]
async fn test_unreachable_relay() {
    let config = config("ws://127.0.0.1:1", "Alice");
    let session = Session::new(
        &config,
        Arc::new(WsTransport::new(&config)),
        Arc::new(Runner::default()),
        Arc::new(Pane::default()),
    );
    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(SyncError::Transport(TransportError::Unavailable))
    ));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_offline_edits_survive_reconnect() {
    let (url, _hub) = start_test_relay(10).await;
    let (alice, _, _) = join(&url, "Alice").await;
    let (bob, _, _) = join(&url, "Bob").await;

    alice.go_offline().await;
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    alice.document().insert(0, "written offline").unwrap();

    alice.reconnect().await.unwrap();
    eventually(|| bob.document().text() == "written offline").await;
}
