//! SSH routing front-end
//!
//! Accepts downstream connections, runs the server-side handshake far
//! enough to learn `(user, ClientVersion)`, decodes the identity, dials
//! the matching upstream (local SSHD for host legs, the session's
//! reverse tunnel for client legs), completes an SSH client handshake
//! over that stream, and splices the two connections with authentication
//! mediated by the connection's [`AuthPipe`].
//!
//! Every connection runs on its own worker; recovery is local to a
//! connection and the accept loop only exits on shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::ssh_key;
use russh::server::{self, Auth, Msg, Session, run_stream};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, SshId};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dial::{BoxedStream, SessionDialListener, SshdDialListener};
use crate::error::{Error, Result};
use crate::identifier::{Identifier, IdentifierKind};
use crate::metrics::MetricsProvider;
use crate::proxy::auth_pipe::{AuthPipe, AuthVerdict, MappedAuth};
use crate::proxy::banner::{BannerCapture, CapturedBanner};
use crate::proxy::splice::{SessionBridge, UpstreamCmd, spawn_session_bridge, spawn_stream_splice};
use crate::session::SessionService;

/// Resolves a downstream identity to a dialed upstream and the auth
/// policy to install between the two legs.
pub(crate) struct UpstreamFinder {
    sessions: Arc<dyn SessionService>,
    sshd_dial: Arc<dyn SshdDialListener>,
    session_dial: Arc<dyn SessionDialListener>,
    upstream_node: bool,
}

impl UpstreamFinder {
    pub(crate) fn new(
        sessions: Arc<dyn SessionService>,
        sshd_dial: Arc<dyn SshdDialListener>,
        session_dial: Arc<dyn SessionDialListener>,
        upstream_node: bool,
    ) -> Self {
        Self {
            sessions,
            sshd_dial,
            session_dial,
            upstream_node,
        }
    }

    /// Identifier decode precedes any dial; at most one dial is issued.
    async fn find(&self, user: &str, client_version: &str) -> Result<(BoxedStream, AuthPipe)> {
        let id = Identifier::decode(user, client_version)?;

        let stream = match id.kind {
            IdentifierKind::Host => {
                info!(session = %id.id, "dialing sshd");
                self.sshd_dial.dial().await?
            }
            IdentifierKind::Client => {
                let session = self.sessions.get_session(&id.id).await?;
                info!(session = %session.id, "dialing session");
                self.session_dial.dial(&session.id).await?
            }
        };

        let pipe = if self.upstream_node {
            AuthPipe::upstream_node(user)
        } else {
            AuthPipe::host(user)
        };
        Ok((stream, pipe))
    }
}

/// The routing surface for one `Proxy::serve` call. Created at serve,
/// shut down at shutdown, not reusable.
pub(crate) struct Routing {
    config: Arc<server::Config>,
    finder: Arc<UpstreamFinder>,
    metrics: Arc<dyn MetricsProvider>,
    drain_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl Routing {
    pub(crate) fn new(
        host_signers: Vec<russh::keys::PrivateKey>,
        finder: UpstreamFinder,
        metrics: Arc<dyn MetricsProvider>,
        drain_timeout: Duration,
    ) -> Self {
        let mut config = server::Config::default();
        config.server_id = SshId::Standard(format!("SSH-2.0-termshare-{}", crate::VERSION));
        config.keys = host_signers;
        let mut methods = MethodSet::empty();
        methods.push(MethodKind::None);
        methods.push(MethodKind::Password);
        methods.push(MethodKind::PublicKey);
        config.methods = methods;
        // The first rejection is the method-discovery `none` attempt;
        // delaying it would slow every legitimate join.
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::ZERO);
        config.keepalive_interval = Some(Duration::from_secs(30));
        config.keepalive_max = 3;

        let (shutdown_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            finder: Arc::new(finder),
            metrics,
            drain_timeout,
            shutdown_tx,
            done_tx,
        }
    }

    /// Accept loop. Runs until [`Routing::shutdown`] fires, then drains
    /// in-flight connections for at most the drain window.
    pub(crate) async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("received shutdown signal, stopping accept loop");
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            self.spawn_connection(&mut connections, socket, peer);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
        drop(listener);

        // Brief drain window, then force-close survivors.
        let deadline = tokio::time::sleep(self.drain_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(remaining = connections.len(), "drain window elapsed, aborting connections");
                    connections.abort_all();
                    break;
                }
                next = connections.join_next() => {
                    if next.is_none() {
                        break;
                    }
                }
            }
        }
        while connections.join_next().await.is_some() {}

        let _ = self.done_tx.send(true);
        Ok(())
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        socket: tokio::net::TcpStream,
        peer: SocketAddr,
    ) {
        debug!(peer = %peer, "accepted downstream connection");

        let (stream, banner) = BannerCapture::new(socket);
        let handler = ConnHandler::new(peer, banner, self.finder.clone(), self.metrics.clone());
        let config = self.config.clone();
        let gauge = GaugeGuard::new(self.metrics.clone());

        connections.spawn(async move {
            // Held across the whole worker so a forced abort during the
            // drain still releases the gauge.
            let _gauge = gauge;
            match run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(peer = %peer, error = %e, "downstream connection ended");
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "downstream handshake failed");
                }
            }
        });
    }

    /// Cancel the accept loop and wait for the drain to finish. Safe to
    /// call from another task; idempotent.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut done_rx = self.done_tx.subscribe();
        let grace = self.drain_timeout + Duration::from_secs(1);
        if tokio::time::timeout(grace, done_rx.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!("routing did not drain within the grace period");
        }
    }
}

/// Open-connections accounting tied to the worker's lifetime.
struct GaugeGuard {
    metrics: Arc<dyn MetricsProvider>,
}

impl GaugeGuard {
    fn new(metrics: Arc<dyn MetricsProvider>) -> Self {
        metrics.connection_opened();
        Self { metrics }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
}

/// Upstream half of one spliced connection.
struct UpstreamLeg {
    handle: client::Handle<UpstreamClientHandler>,
    pipe: Arc<AuthPipe>,
    authed: bool,
}

/// Server-side handler for one downstream connection.
struct ConnHandler {
    peer: SocketAddr,
    banner: CapturedBanner,
    finder: Arc<UpstreamFinder>,
    metrics: Arc<dyn MetricsProvider>,
    upstream: Option<UpstreamLeg>,
    downstream_handle: Arc<OnceLock<server::Handle>>,
    bridges: HashMap<ChannelId, SessionBridge>,
}

impl ConnHandler {
    fn new(
        peer: SocketAddr,
        banner: CapturedBanner,
        finder: Arc<UpstreamFinder>,
        metrics: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            peer,
            banner,
            finder,
            metrics,
            upstream: None,
            downstream_handle: Arc::new(OnceLock::new()),
            bridges: HashMap::new(),
        }
    }

    /// Dial and handshake the upstream leg once, on the first downstream
    /// auth attempt. Failure aborts the downstream handshake; the client
    /// observes a clean handshake failure, never a partial shell.
    async fn ensure_upstream(&mut self, user: &str) -> Result<()> {
        if self.upstream.is_some() {
            return Ok(());
        }

        let client_version = self
            .banner
            .get()
            .cloned()
            .ok_or_else(|| Error::BadIdentifier("client version not observed".to_string()))?;

        let (stream, pipe) = match self.finder.find(user, &client_version).await {
            Ok(found) => found,
            Err(e) => {
                self.metrics.connection_rejected();
                if e.is_handshake_noise() {
                    debug!(peer = %self.peer, user = %user, error = %e, "rejecting connection");
                } else {
                    info!(peer = %self.peer, user = %user, error = %e, "rejecting connection");
                }
                return Err(e);
            }
        };

        let pipe = Arc::new(pipe);
        let mut config = client::Config::default();
        config.client_id = SshId::Standard(format!("SSH-2.0-termshare-{}", crate::VERSION));
        config.keepalive_interval = Some(Duration::from_secs(30));
        config.keepalive_max = 3;

        let upstream_handler = UpstreamClientHandler {
            pipe: pipe.clone(),
            downstream: self.downstream_handle.clone(),
        };
        let handle = match client::connect_stream(Arc::new(config), stream, upstream_handler).await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.connection_rejected();
                let e = match e {
                    Error::Ssh(inner) => {
                        Error::Unreachable(format!("upstream handshake: {}", inner))
                    }
                    other => other,
                };
                info!(peer = %self.peer, error = %e, "upstream handshake failed");
                return Err(e);
            }
        };

        self.upstream = Some(UpstreamLeg {
            handle,
            pipe,
            authed: false,
        });
        Ok(())
    }

    fn authed_upstream(&mut self) -> Option<&mut UpstreamLeg> {
        self.upstream.as_mut().filter(|leg| leg.authed)
    }

    /// Methods the downstream may still try after a discard.
    fn remaining_methods(discarded: MethodKind) -> Option<MethodSet> {
        let mut methods = MethodSet::empty();
        for kind in [MethodKind::Password, MethodKind::PublicKey] {
            if kind != discarded {
                methods.push(kind);
            }
        }
        Some(methods)
    }

    /// Run the bridged attempt, rendering an upstream refusal as the
    /// standard SSH auth failure downstream. No retry.
    async fn bridge_or_reject(
        &mut self,
        verdict: AuthVerdict,
        original: Option<&str>,
    ) -> Result<Auth> {
        match self.bridge_attempt(verdict, original).await {
            Err(Error::AuthRejected) => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
            other => other,
        }
    }

    /// Attempt the mapped credential upstream; an upstream refusal is
    /// `AuthRejected`.
    async fn bridge_attempt(&mut self, verdict: AuthVerdict, original: Option<&str>) -> Result<Auth> {
        let leg = match self.upstream.as_mut() {
            Some(leg) => leg,
            None => return Err(Error::Internal("auth attempt without upstream".to_string())),
        };
        let user = leg.pipe.user().to_string();

        let result = match verdict {
            AuthVerdict::None => leg.handle.authenticate_none(user).await?,
            AuthVerdict::PassThrough => {
                let password = original
                    .ok_or_else(|| Error::Internal("pass-through without credential".to_string()))?;
                leg.handle.authenticate_password(user, password).await?
            }
            AuthVerdict::Map(MappedAuth::Password(password)) => {
                leg.handle.authenticate_password(user, password).await?
            }
            AuthVerdict::Discard => {
                return Ok(Auth::Reject {
                    proceed_with_methods: Self::remaining_methods(MethodKind::None),
                    partial_success: false,
                });
            }
        };

        match result {
            AuthResult::Success => {
                leg.authed = true;
                Ok(Auth::Accept)
            }
            AuthResult::Failure { .. } => {
                self.metrics.auth_rejected();
                debug!(peer = %self.peer, "upstream refused bridged authentication");
                Err(Error::AuthRejected)
            }
        }
    }
}

impl server::Handler for ConnHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        self.ensure_upstream(user).await?;
        let Some(leg) = self.upstream.as_mut() else {
            return Err(Error::Internal("upstream missing after dial".to_string()));
        };
        let user = leg.pipe.user().to_string();

        match leg.pipe.none_verdict() {
            AuthVerdict::None => match leg.handle.authenticate_none(user).await? {
                AuthResult::Success => {
                    leg.authed = true;
                    Ok(Auth::Accept)
                }
                // `none` doubles as method discovery; let the client go
                // on to a real method rather than failing the handshake.
                AuthResult::Failure { .. } => Ok(Auth::Reject {
                    proceed_with_methods: Self::remaining_methods(MethodKind::None),
                    partial_success: false,
                }),
            },
            _ => Ok(Auth::Reject {
                proceed_with_methods: Self::remaining_methods(MethodKind::None),
                partial_success: false,
            }),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        self.ensure_upstream(user).await?;
        let Some(leg) = self.upstream.as_mut() else {
            return Err(Error::Internal("upstream missing after dial".to_string()));
        };

        match leg.pipe.password_verdict(password) {
            AuthVerdict::Discard => Ok(Auth::Reject {
                proceed_with_methods: Self::remaining_methods(MethodKind::Password),
                partial_success: false,
            }),
            AuthVerdict::PassThrough => {
                self.bridge_or_reject(AuthVerdict::PassThrough, Some(password))
                    .await
            }
            other => self.bridge_or_reject(other, Some(password)).await,
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth> {
        self.ensure_upstream(user).await?;
        let Some(leg) = self.upstream.as_mut() else {
            return Err(Error::Internal("upstream missing after dial".to_string()));
        };

        // Refuse discarded keys before the client bothers signing.
        match leg.pipe.public_key_verdict(public_key)? {
            AuthVerdict::Discard => Ok(Auth::Reject {
                proceed_with_methods: Self::remaining_methods(MethodKind::PublicKey),
                partial_success: false,
            }),
            _ => Ok(Auth::Accept),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth> {
        self.ensure_upstream(user).await?;
        let Some(leg) = self.upstream.as_mut() else {
            return Err(Error::Internal("upstream missing after dial".to_string()));
        };

        match leg.pipe.public_key_verdict(public_key)? {
            AuthVerdict::Discard => Ok(Auth::Reject {
                proceed_with_methods: Self::remaining_methods(MethodKind::PublicKey),
                partial_success: false,
            }),
            verdict => self.bridge_or_reject(verdict, None).await,
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<()> {
        let _ = self.downstream_handle.set(session.handle());
        debug!(peer = %self.peer, "downstream authenticated");
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool> {
        let _ = self.downstream_handle.set(session.handle());
        let downstream = session.handle();
        let Some(leg) = self.authed_upstream() else {
            return Ok(false);
        };

        match leg.handle.channel_open_session().await {
            Ok(upstream_channel) => {
                let bridge = spawn_session_bridge(upstream_channel, downstream, channel.id());
                self.bridges.insert(channel.id(), bridge);
                Ok(true)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "upstream refused session channel");
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let Some(leg) = self.authed_upstream() else {
            return Ok(false);
        };

        match leg
            .handle
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(upstream_channel) => {
                spawn_stream_splice(channel, upstream_channel, "direct-tcpip");
                Ok(true)
            }
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "upstream refused direct-tcpip channel");
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool> {
        let _ = self.downstream_handle.set(session.handle());
        let address = address.to_string();
        let requested = *port;
        let Some(leg) = self.authed_upstream() else {
            return Ok(false);
        };
        Ok(leg
            .handle
            .tcpip_forward(address, requested)
            .await
            .map(|_| true)
            .unwrap_or(false))
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        let address = address.to_string();
        let Some(leg) = self.authed_upstream() else {
            return Ok(false);
        };
        Ok(leg
            .handle
            .cancel_tcpip_forward(address, port)
            .await
            .map(|_| true)
            .unwrap_or(false))
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Data(data.to_vec()));
        }
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::ExtendedData(code, data.to_vec()));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            });
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Shell);
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Exec(data.to_vec()));
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Env(
                variable_name.to_string(),
                variable_value.to_string(),
            ));
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Subsystem(name.to_string()));
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            });
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&channel) {
            bridge.send(UpstreamCmd::Eof);
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(bridge) = self.bridges.remove(&channel) {
            bridge.send(UpstreamCmd::Close);
        }
        Ok(())
    }
}

impl Drop for ConnHandler {
    fn drop(&mut self) {
        // Bridges close their upstream channels when the command senders
        // drop; the upstream connection itself closes with the handle.
        debug!(peer = %self.peer, "downstream connection closed");
    }
}

/// Client-side handler for the upstream leg.
struct UpstreamClientHandler {
    pipe: Arc<AuthPipe>,
    downstream: Arc<OnceLock<server::Handle>>,
}

impl client::Handler for UpstreamClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool> {
        // Accepted risk, on purpose: hosts rotate keys freely and nothing
        // pins them at registration, so the pipe admits any upstream key.
        let accept = self.pipe.verify_upstream_host_key(server_public_key);
        debug!(accept, "verified upstream host key");
        Ok(accept)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<()> {
        // The upstream SSHD opens these toward the host agent's reverse
        // tunnel; relay them to the downstream connection.
        let Some(handle) = self.downstream.get() else {
            return Err(Error::PeerClosed);
        };
        let down = handle
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await?;
        spawn_stream_splice(down, channel, "forwarded-tcpip");
        Ok(())
    }
}
