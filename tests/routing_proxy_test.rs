//! End-to-end routing tests against stub SSH endpoints
//!
//! The proxy listens on a loopback TCP port; stub russh servers stand in
//! for the local SSHD and for a session's reverse tunnel, each bound to
//! a unix socket in a temp dir. Real russh clients drive the downstream
//! leg, so both handshakes, the auth bridging, and the splice run for
//! real.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodKind, MethodSet, SshId};
use tempfile::TempDir;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::time::timeout;

use termshare::dial::{BoxedStream, SessionDialListener, SshdDialListener};
use termshare::identifier::{Identifier, IdentifierKind};
use termshare::metrics::AtomicMetrics;
use termshare::proxy::{Proxy, authorized_key_line};
use termshare::session::{MemorySessionService, Session as SessionDescriptor, SessionService};
use termshare::{Error, Result};

const WAIT: Duration = Duration::from_secs(5);

fn ed25519_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

fn descriptor(id: &str) -> SessionDescriptor {
    SessionDescriptor {
        id: id.to_string(),
        node_addr: String::new(),
        host_user: "host".to_string(),
        created_at: chrono::Utc::now(),
        command: vec!["bash".to_string(), "-c".to_string(), "PS1='' bash --norc".to_string()],
        force_command: vec![],
        host: "127.0.0.1:2222".to_string(),
    }
}

// ── Stub SSHD ────────────────────────────────────────────────────────────

/// Upstream stand-in: accepts exactly one password, echoes session data.
#[derive(Clone)]
struct StubSshd {
    expected_password: Arc<String>,
    seen_passwords: Arc<Mutex<Vec<String>>>,
}

impl StubSshd {
    fn new(expected_password: &str) -> Self {
        Self {
            expected_password: Arc::new(expected_password.to_string()),
            seen_passwords: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn seen_passwords(&self) -> Vec<String> {
        self.seen_passwords.lock().unwrap().clone()
    }

    /// Bind on `path` and serve connections until dropped.
    fn start(&self, path: &Path) {
        let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
        listener.set_nonblocking(true).unwrap();
        let listener = UnixListener::from_std(listener).unwrap();

        let mut config = server::Config::default();
        config.server_id = SshId::Standard("SSH-2.0-stub-sshd".to_string());
        config.keys = vec![ed25519_key()];
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::None);
        methods.push(MethodKind::Password);
        config.methods = methods;
        config.auth_rejection_time = Duration::from_millis(10);
        config.auth_rejection_time_initial = Some(Duration::ZERO);
        let config = Arc::new(config);

        let stub = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = StubSshdHandler { stub: stub.clone() };
                let config = config.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });
    }
}

struct StubSshdHandler {
    stub: StubSshd,
}

impl server::Handler for StubSshdHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> std::result::Result<Auth, Self::Error> {
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::Password);
        Ok(Auth::Reject {
            proceed_with_methods: Some(methods),
            partial_success: false,
        })
    }

    async fn auth_password(
        &mut self,
        _user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        self.stub
            .seen_passwords
            .lock()
            .unwrap()
            .push(password.to_string());
        if password == *self.stub.expected_password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = session.data(channel, CryptoVec::from(data.to_vec()));
        Ok(())
    }
}

// ── Counting dial listeners ──────────────────────────────────────────────

struct CountingSshdDial {
    path: PathBuf,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl SshdDialListener for CountingSshdDial {
    async fn dial(&self) -> Result<BoxedStream> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| Error::Unreachable(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

struct CountingSessionDial {
    dir: PathBuf,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionDialListener for CountingSessionDial {
    async fn dial(&self, session_id: &str) -> Result<BoxedStream> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("{}.sock", session_id));
        let stream = UnixStream::connect(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(session_id.to_string()),
            _ => Error::Unreachable(e.to_string()),
        })?;
        Ok(Box::new(stream))
    }
}

// ── Proxy harness ────────────────────────────────────────────────────────

struct TestEnv {
    proxy: Arc<Proxy>,
    addr: std::net::SocketAddr,
    sessions: Arc<MemorySessionService>,
    metrics: Arc<AtomicMetrics>,
    sshd_dials: Arc<AtomicUsize>,
    session_dials: Arc<AtomicUsize>,
    serve_task: tokio::task::JoinHandle<Result<()>>,
    _tmp: TempDir,
}

impl TestEnv {
    fn sockets_dir(&self) -> PathBuf {
        self._tmp.path().join("sessions")
    }

    fn sshd_socket(&self) -> PathBuf {
        self._tmp.path().join("sshd.sock")
    }
}

async fn start_proxy(upstream_node: bool) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let sockets_dir = tmp.path().join("sessions");
    std::fs::create_dir_all(&sockets_dir).unwrap();

    let sessions = Arc::new(MemorySessionService::new());
    let metrics = Arc::new(AtomicMetrics::new());
    let sshd_dials = Arc::new(AtomicUsize::new(0));
    let session_dials = Arc::new(AtomicUsize::new(0));

    let proxy = Arc::new(
        Proxy::new(
            vec![ed25519_key()],
            sessions.clone(),
            Arc::new(CountingSshdDial {
                path: tmp.path().join("sshd.sock"),
                count: sshd_dials.clone(),
            }),
            Arc::new(CountingSessionDial {
                dir: sockets_dir,
                count: session_dials.clone(),
            }),
        )
        .with_upstream_node(upstream_node)
        .with_metrics(metrics.clone())
        .with_drain_timeout(Duration::from_millis(300)),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = proxy.clone();
    let serve_task = tokio::spawn(async move { serving.serve(listener).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestEnv {
        proxy,
        addr,
        sessions,
        metrics,
        sshd_dials,
        session_dials,
        serve_task,
        _tmp: tmp,
    }
}

// ── Downstream test client ───────────────────────────────────────────────

struct TestClientHandler;

impl client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect(
    addr: std::net::SocketAddr,
    banner: Option<String>,
) -> client::Handle<TestClientHandler> {
    let mut config = client::Config::default();
    if let Some(banner) = banner {
        config.client_id = SshId::Standard(banner);
    }
    client::connect(Arc::new(config), addr, TestClientHandler)
        .await
        .unwrap()
}

fn client_user(id: &str) -> String {
    let (user, _) = Identifier {
        kind: IdentifierKind::Client,
        id: id.to_string(),
        node_addr: String::new(),
    }
    .encode()
    .unwrap();
    user
}

fn host_identity(id: &str) -> (String, String) {
    Identifier {
        kind: IdentifierKind::Host,
        id: id.to_string(),
        node_addr: String::new(),
    }
    .encode()
    .unwrap()
}

async fn read_exactly(channel: &mut Channel<client::Msg>, want: &[u8]) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < want.len() {
        match timeout(WAIT, channel.wait()).await.expect("read timed out") {
            Some(ChannelMsg::Data { data }) => got.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => got.extend_from_slice(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    got
}

async fn wait_for_gauge(metrics: &AtomicMetrics, want: i64) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while metrics.open_connections() != want {
        assert!(
            tokio::time::Instant::now() < deadline,
            "gauge stuck at {} (want {})",
            metrics.open_connections(),
            want
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_join_splices_to_session_tunnel() {
    let env = start_proxy(false).await;

    let client_key = ed25519_key();
    let expected = authorized_key_line(client_key.public_key()).unwrap();

    let stub = StubSshd::new(&expected);
    stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    let mut handle = connect(env.addr, None).await;
    let auth = handle
        .authenticate_publickey(
            client_user("s1"),
            PrivateKeyWithHashAlg::new(Arc::new(client_key), None::<HashAlg>),
        )
        .await
        .unwrap();
    assert!(matches!(auth, AuthResult::Success));

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(&b"echo hello\n"[..]).await.unwrap();

    let got = read_exactly(&mut channel, b"echo hello\n").await;
    assert_eq!(got, b"echo hello\n");

    assert_eq!(env.session_dials.load(Ordering::SeqCst), 1);
    assert_eq!(env.sshd_dials.load(Ordering::SeqCst), 0);

    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await;
    wait_for_gauge(&env.metrics, 0).await;

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_session_fails_handshake_without_dial() {
    let env = start_proxy(false).await;
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    let mut handle = connect(env.addr, None).await;
    let result = handle.authenticate_none(client_user("nonesuch")).await;
    assert!(result.is_err(), "expected handshake failure, got {:?}", result);

    // The lookup failed before any dial was issued.
    assert_eq!(env.session_dials.load(Ordering::SeqCst), 0);
    assert_eq!(env.sshd_dials.load(Ordering::SeqCst), 0);

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_identifier_fails_handshake() {
    let env = start_proxy(false).await;

    let mut handle = connect(env.addr, None).await;
    // ':' marks a node-address suffix, which must be valid base64.
    let result = handle.authenticate_none("s1:!!!").await;
    assert!(result.is_err());
    assert_eq!(env.session_dials.load(Ordering::SeqCst), 0);
    assert_eq!(env.sshd_dials.load(Ordering::SeqCst), 0);

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_host_leg_dials_sshd_client_leg_dials_session() {
    let env = start_proxy(false).await;

    let host_key = ed25519_key();
    let host_line = authorized_key_line(host_key.public_key()).unwrap();
    let sshd_stub = StubSshd::new(&host_line);
    sshd_stub.start(&env.sshd_socket());

    let client_key = ed25519_key();
    let client_line = authorized_key_line(client_key.public_key()).unwrap();
    let tunnel_stub = StubSshd::new(&client_line);
    tunnel_stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    // Host leg: host banner routes to the sshd dialer.
    let (host_user, host_banner) = host_identity("s1");
    let mut host = connect(env.addr, Some(host_banner)).await;
    let auth = host
        .authenticate_publickey(
            host_user,
            PrivateKeyWithHashAlg::new(Arc::new(host_key), None::<HashAlg>),
        )
        .await
        .unwrap();
    assert!(matches!(auth, AuthResult::Success));

    // Client leg: plain banner routes to the session dialer.
    let mut client = connect(env.addr, None).await;
    let auth = client
        .authenticate_publickey(
            client_user("s1"),
            PrivateKeyWithHashAlg::new(Arc::new(client_key), None::<HashAlg>),
        )
        .await
        .unwrap();
    assert!(matches!(auth, AuthResult::Success));

    assert_eq!(env.sshd_dials.load(Ordering::SeqCst), 1);
    assert_eq!(env.session_dials.load(Ordering::SeqCst), 1);

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publickey_is_converted_to_authorized_keys_password() {
    let env = start_proxy(false).await;

    let client_key = ed25519_key();
    let expected = authorized_key_line(client_key.public_key()).unwrap();

    let stub = StubSshd::new(&expected);
    stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    let mut handle = connect(env.addr, None).await;
    let auth = handle
        .authenticate_publickey(
            client_user("s1"),
            PrivateKeyWithHashAlg::new(Arc::new(client_key), None::<HashAlg>),
        )
        .await
        .unwrap();
    assert!(matches!(auth, AuthResult::Success));

    // The upstream observed one password: the authorized-keys line.
    assert_eq!(stub.seen_passwords(), vec![expected]);

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unauthorized_key_is_rejected_downstream() {
    let env = start_proxy(false).await;

    let permitted = ed25519_key();
    let expected = authorized_key_line(permitted.public_key()).unwrap();
    let stub = StubSshd::new(&expected);
    stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    // A different key maps to a different password; the upstream refuses.
    let intruder = ed25519_key();
    let mut handle = connect(env.addr, None).await;
    let auth = handle
        .authenticate_publickey(
            client_user("s1"),
            PrivateKeyWithHashAlg::new(Arc::new(intruder), None::<HashAlg>),
        )
        .await;
    match auth {
        Ok(AuthResult::Failure { .. }) | Err(_) => {}
        other => panic!("expected auth failure, got {:?}", other),
    }

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_upstream_node_passes_password_through() {
    let env = start_proxy(true).await;

    let stub = StubSshd::new("sekret");
    stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    let mut handle = connect(env.addr, None).await;
    let auth = handle
        .authenticate_password(client_user("s1"), "sekret")
        .await
        .unwrap();
    assert!(matches!(auth, AuthResult::Success));
    assert_eq!(stub.seen_passwords(), vec!["sekret".to_string()]);

    env.proxy.shutdown().await.unwrap();
    env.serve_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_during_active_splice() {
    let env = start_proxy(false).await;

    let client_key = ed25519_key();
    let expected = authorized_key_line(client_key.public_key()).unwrap();
    let stub = StubSshd::new(&expected);
    stub.start(&env.sockets_dir().join("s1.sock"));
    env.sessions.create_session(descriptor("s1")).await.unwrap();

    let mut handle = connect(env.addr, None).await;
    handle
        .authenticate_publickey(
            client_user("s1"),
            PrivateKeyWithHashAlg::new(Arc::new(client_key), None::<HashAlg>),
        )
        .await
        .unwrap();
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_shell(true).await.unwrap();

    // Shutdown must return within the drain window plus grace.
    timeout(Duration::from_secs(3), env.proxy.shutdown())
        .await
        .expect("shutdown exceeded the drain window")
        .unwrap();
    env.serve_task.await.unwrap().unwrap();

    // The spliced client observes its connection closing.
    let observed_close = loop {
        match timeout(WAIT, channel.wait()).await {
            Ok(Some(ChannelMsg::Close)) | Ok(None) => break true,
            Ok(Some(_)) => continue,
            Err(_) => break false,
        }
    };
    assert!(observed_close, "client never observed the close");

    wait_for_gauge(&env.metrics, 0).await;
}
