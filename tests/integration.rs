//! Integration tests for Wakegate

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use wakegate::codec::{decode_string, encode_frame, encode_string, read_frame};
use wakegate::config::{split_host_port, Config};
use wakegate::controller::BackendController;
use wakegate::error::ControllerError;
use wakegate::handshake::{Handshake, NextState};
use wakegate::lifecycle::{BackendManager, Lifecycle};
use wakegate::proxy::ProxyServer;

const BACKEND_STATUS: &str =
    r#"{"version":{"name":"1.21","protocol":767},"players":{"max":20,"online":0},"description":{"text":"Live world"}}"#;

/// Controller that counts script runs instead of running anything
#[derive(Default)]
struct CountingController {
    start_delay: Duration,
    fail_start: bool,
    starts: AtomicU32,
    stops: AtomicU32,
}

#[async_trait]
impl BackendController for CountingController {
    async fn start(&self) -> Result<(), ControllerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.start_delay).await;
        if self.fail_start {
            return Err(ControllerError::Wait {
                script: "start".to_string(),
                source: std::io::Error::other("boot failed"),
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ControllerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-process stand-in for the real game server.
///
/// Answers status queries with `BACKEND_STATUS` and echoes everything a
/// login sends after its handshake. Every handshake it sees is reported on
/// `handshakes`.
struct FakeBackend {
    addr: String,
    handshakes: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn spawn_fake_backend() -> FakeBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, handshakes) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_fake_client(stream, tx.clone()));
        }
    });

    FakeBackend { addr, handshakes }
}

async fn serve_fake_client(stream: TcpStream, handshakes: mpsc::UnboundedSender<Vec<u8>>) {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);

    let Ok(first) = read_frame(&mut rd).await else { return };
    let _ = handshakes.send(first.raw.clone());
    let Ok(handshake) = Handshake::parse(&first.payload) else { return };

    match handshake.next_state {
        NextState::Status => {
            if read_frame(&mut rd).await.is_err() {
                return;
            }
            let response = encode_frame(0, &encode_string(BACKEND_STATUS)).unwrap();
            let _ = wr.write_all(&response).await;
            if let Ok(ping) = read_frame(&mut rd).await {
                let _ = wr.write_all(&ping.raw).await;
            }
        }
        NextState::Login => {
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        }
    }
}

struct Harness {
    addr: SocketAddr,
    manager: Arc<BackendManager>,
    controller: Arc<CountingController>,
    _shutdown_tx: watch::Sender<bool>,
}

fn test_config(backend: &str) -> Config {
    let mut config = Config::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.server.backend = backend.to_string();
    config.server.handshake_timeout_ms = 2000;
    config.lifecycle.connect_timeout_ms = 1000;
    config.lifecycle.io_timeout_ms = 1000;
    config.status.description = "A Server".to_string();
    config
}

async fn start_proxy(config: Config, controller: CountingController) -> Harness {
    let config = Arc::new(config);
    let controller = Arc::new(controller);
    let manager = BackendManager::from_config(&config, Arc::clone(&controller) as Arc<dyn BackendController>);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = ProxyServer::new(config, Arc::clone(&manager), shutdown_rx);
    tokio::spawn(async move { proxy.serve(listener).await });

    Harness {
        addr,
        manager,
        controller,
        _shutdown_tx: shutdown_tx,
    }
}

fn client_handshake(next_state: NextState) -> Vec<u8> {
    Handshake {
        protocol_version: 767,
        server_address: "localhost".to_string(),
        port: 25565,
        next_state,
    }
    .encode()
    .unwrap()
}

fn ping_frame() -> Vec<u8> {
    encode_frame(1, &1u64.to_be_bytes()).unwrap()
}

/// Run a full server-list query, returning the raw response frame
async fn query_status(addr: SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = client_handshake(NextState::Status);
    request.extend_from_slice(&encode_frame(0, &[]).unwrap());
    request.extend_from_slice(&ping_frame());
    stream.write_all(&request).await.unwrap();

    let response = read_frame(&mut stream).await.unwrap();
    assert!(response.is(0));

    let pong = read_frame(&mut stream).await.unwrap();
    assert_eq!(pong.raw, ping_frame());
    assert_eq!(pong.payload, vec![0, 0, 0, 0, 0, 0, 0, 1]);

    response.raw
}

async fn status_json(response: &[u8]) -> serde_json::Value {
    let mut stream: &[u8] = response;
    let frame = read_frame(&mut stream).await.unwrap();
    let (json, _) = decode_string(&frame.payload).unwrap();
    serde_json::from_str(&json).unwrap()
}

/// Attempt a login, returning the kick message if the proxy sends one
async fn login_kick(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&client_handshake(NextState::Login))
        .await
        .unwrap();

    let frame = read_frame(&mut stream).await.unwrap();
    assert!(frame.is(0));
    let (chat, _) = decode_string(&frame.payload).unwrap();
    serde_json::from_str(&chat).unwrap()
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_status_while_offline_does_not_start_backend() {
    let backend = spawn_fake_backend().await;
    let harness = start_proxy(test_config(&backend.addr), CountingController::default()).await;

    let response = query_status(harness.addr).await;
    let json = status_json(&response).await;
    assert_eq!(json["description"]["text"], "A Server (idle)");
    assert_eq!(json["version"]["name"], "unknown");
    assert_eq!(json["players"]["max"], 0);

    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Offline);
}

#[tokio::test]
async fn test_status_while_online_merges_backend_document() {
    let mut backend = spawn_fake_backend().await;
    let harness = start_proxy(test_config(&backend.addr), CountingController::default()).await;

    harness.manager.request_start();
    assert!(harness.manager.wait_until_online(Duration::from_secs(5)).await);

    let response = query_status(harness.addr).await;
    let json = status_json(&response).await;
    assert_eq!(json["description"]["text"], "Live world");

    // Secondary query carries the client's protocol and the backend's address
    let raw = backend.handshakes.recv().await.unwrap();
    let mut stream: &[u8] = &raw;
    let frame = read_frame(&mut stream).await.unwrap();
    let sent = Handshake::parse(&frame.payload).unwrap();
    assert_eq!(sent.protocol_version, 767);
    assert_eq!(sent.server_address, "127.0.0.1");
    assert_eq!(sent.port, split_host_port(&backend.addr).unwrap().1);

    // Once the backend is stopped the adopted document is served annotated
    assert!(harness.manager.shutdown().await);
    let json = status_json(&query_status(harness.addr).await).await;
    assert_eq!(json["description"]["text"], "Live world (idle)");
    assert_eq!(json["version"]["name"], "1.21");
}

#[tokio::test]
async fn test_cached_status_survives_backend_stop() {
    let backend = spawn_fake_backend().await;
    let mut config = test_config(&backend.addr);
    config.status.cache = true;
    let harness = start_proxy(config, CountingController::default()).await;

    // Nothing cached yet
    let json = status_json(&query_status(harness.addr).await).await;
    assert_eq!(json["description"]["text"], "A Server (idle)");

    harness.manager.request_start();
    assert!(harness.manager.wait_until_online(Duration::from_secs(5)).await);
    let live = query_status(harness.addr).await;
    assert_eq!(live, encode_frame(0, &encode_string(BACKEND_STATUS)).unwrap());

    assert!(harness.manager.shutdown().await);
    assert_eq!(harness.controller.stops.load(Ordering::SeqCst), 1);

    let cached = query_status(harness.addr).await;
    assert_eq!(cached, live);
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_start_backend_once() {
    let backend = spawn_fake_backend().await;
    let controller = CountingController {
        start_delay: Duration::from_millis(500),
        ..Default::default()
    };
    let harness = start_proxy(test_config(&backend.addr), controller).await;

    let first = tokio::spawn(login_kick(harness.addr));
    let second = tokio::spawn(login_kick(harness.addr));
    let mut kicks = vec![first.await.unwrap(), second.await.unwrap()];
    kicks.sort();

    let defaults = Config::default().messages;
    let mut expected = vec![defaults.starting.clone(), defaults.still_starting.clone()];
    expected.sort();
    assert_eq!(kicks, expected);
    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 1);

    // Status while starting, no cache yet
    let json = status_json(&query_status(harness.addr).await).await;
    assert_eq!(json["description"]["text"], "A Server (starting)");

    assert!(harness.manager.wait_until_online(Duration::from_secs(5)).await);
    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_login_relays_to_online_backend() {
    let mut backend = spawn_fake_backend().await;
    let mut config = test_config(&backend.addr);
    config.lifecycle.idle_shutdown_delay_secs = 0;
    let harness = start_proxy(config, CountingController::default()).await;

    harness.manager.request_start();
    assert!(harness.manager.wait_until_online(Duration::from_secs(5)).await);

    // Handshake and login start arrive in one segment
    let handshake = client_handshake(NextState::Login);
    let mut login_start = Vec::new();
    wakegate::codec::write_string("Steve", &mut login_start);
    let login_start = encode_frame(0, &login_start).unwrap();

    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let mut first_write = handshake.clone();
    first_write.extend_from_slice(&login_start);
    stream.write_all(&first_write).await.unwrap();

    let mut echoed = vec![0u8; login_start.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, login_start);
    assert_eq!(backend.handshakes.recv().await.unwrap(), handshake);
    assert_eq!(harness.manager.connected_sessions(), 1);

    stream.write_all(b"play data").await.unwrap();
    let mut echoed = [0u8; 9];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"play data");

    drop(stream);
    let manager = Arc::clone(&harness.manager);
    assert!(wait_until(Duration::from_secs(5), || manager.connected_sessions() == 0).await);

    // Last player gone, the idle check stops the backend
    let controller = Arc::clone(&harness.controller);
    assert!(wait_until(Duration::from_secs(5), || controller.stops.load(Ordering::SeqCst) == 1).await);
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Offline);
}

#[tokio::test]
async fn test_login_waits_for_start_when_configured() {
    let backend = spawn_fake_backend().await;
    let mut config = test_config(&backend.addr);
    config.login.wait_for_start = true;
    let controller = CountingController {
        start_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let harness = start_proxy(config, controller).await;

    // The login that triggers the start is still kicked
    assert_eq!(login_kick(harness.addr).await, Config::default().messages.starting);
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Starting);

    // A login during the start is held and then relayed
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    let mut request = client_handshake(NextState::Login);
    request.extend_from_slice(b"hello");
    stream.write_all(&request).await.unwrap();

    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"hello");
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Online);
    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_backend_kicks_and_marks_offline() {
    // Nothing listens on the backend address
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = closed.local_addr().unwrap().to_string();
    drop(closed);

    let harness = start_proxy(test_config(&backend_addr), CountingController::default()).await;
    harness.manager.request_start();
    assert!(harness.manager.wait_until_online(Duration::from_secs(5)).await);

    assert_eq!(login_kick(harness.addr).await, Config::default().messages.unreachable);
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Offline);
    assert_eq!(harness.controller.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_start_rejects_later_logins() {
    let backend = spawn_fake_backend().await;
    let controller = CountingController {
        fail_start: true,
        ..Default::default()
    };
    let harness = start_proxy(test_config(&backend.addr), controller).await;
    let mut fatal = harness.manager.subscribe_fatal();

    let messages = Config::default().messages;
    assert_eq!(login_kick(harness.addr).await, messages.starting);

    fatal.wait_for(|message| message.is_some()).await.unwrap();
    assert!(harness.manager.is_degraded());
    assert_eq!(login_kick(harness.addr).await, messages.unavailable);
    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Protocol violations
// ============================================================================

async fn assert_dropped(addr: SocketAddr, bytes: &[u8], close_write: bool) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    if close_write {
        stream.shutdown().await.unwrap();
    }

    let mut received = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("proxy should close the connection");
    // A reset is as good as a clean close
    if result.is_ok() {
        assert!(received.is_empty(), "proxy answered a bad client: {:?}", received);
    }
}

#[tokio::test]
async fn test_protocol_violations_are_dropped() {
    let backend = spawn_fake_backend().await;
    let mut config = test_config(&backend.addr);
    config.server.handshake_timeout_ms = 300;
    let harness = start_proxy(config, CountingController::default()).await;

    // Wrong first packet id
    assert_dropped(harness.addr, &encode_frame(5, b"junk").unwrap(), false).await;

    // Legacy server-list ping
    assert_dropped(harness.addr, &[0xFE, 0x01], true).await;

    // Unknown next state
    let mut payload = Vec::new();
    wakegate::codec::write_varint(767, &mut payload);
    wakegate::codec::write_string("localhost", &mut payload);
    payload.extend_from_slice(&25565u16.to_be_bytes());
    wakegate::codec::write_varint(3, &mut payload);
    assert_dropped(harness.addr, &encode_frame(0, &payload).unwrap(), false).await;

    // Silent client hits the handshake timeout
    assert_dropped(harness.addr, &[], false).await;

    assert_eq!(harness.controller.starts.load(Ordering::SeqCst), 0);
    assert_eq!(harness.manager.lifecycle(), Lifecycle::Offline);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let toml = r#"
[server]
listen = "0.0.0.0:25565"
backend = "localhost:25567"
pid_file = "/run/wakegate.pid"

[lifecycle]
idle_shutdown_delay_secs = 90

[status]
version_name = "Paper 1.21"
protocol = 767
max_players = 40
description = "Survival"

[messages]
unreachable = "Backend is down"

[scripts.start]
command = "./StartServer"
args = ["--nogui"]
working_dir = "/srv/minecraft"

[scripts.start.env]
JAVA_OPTS = "-Xmx4G"

[scripts.stop]
command = "./StopServer"
timeout_secs = 120
"#;

    let config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.lifecycle.idle_shutdown_delay(), Duration::from_secs(90));
    assert_eq!(config.status.protocol, 767);
    assert_eq!(config.messages.unreachable, "Backend is down");
    assert_eq!(config.messages.starting, Config::default().messages.starting);
    assert_eq!(
        config.scripts.start.env.get("JAVA_OPTS").map(String::as_str),
        Some("-Xmx4G")
    );
    assert_eq!(config.scripts.stop.timeout(), Some(Duration::from_secs(120)));
}
