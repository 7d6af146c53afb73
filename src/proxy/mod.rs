//! SSH routing proxy
//!
//! [`Proxy`] is the lifecycle wrapper around the routing surface: one
//! `serve` per instance, an idempotent `shutdown` callable from any
//! task, and a mutex so shutdown always observes a consistent routing
//! handle. Collaborators (session registry, dial listeners, metrics)
//! are shared read-only and outlive the proxy.

pub mod auth_pipe;
pub mod banner;
mod routing;
pub mod splice;

pub use auth_pipe::{AuthPipe, AuthVerdict, MappedAuth, authorized_key_line};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use russh::keys::PrivateKey;
use tokio::net::TcpListener;

use crate::dial::{SessionDialListener, SshdDialListener};
use crate::error::{Error, Result};
use crate::metrics::{MetricsProvider, NoopMetrics};
use crate::session::SessionService;
use routing::{Routing, UpstreamFinder};

/// Default window granted to in-flight connections on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Lifecycle {
    Idle,
    Running(Arc<Routing>),
    Stopped,
}

/// The server-side SSH routing proxy.
pub struct Proxy {
    host_signers: Vec<PrivateKey>,
    session_service: Arc<dyn SessionService>,
    sshd_dial_listener: Arc<dyn SshdDialListener>,
    session_dial_listener: Arc<dyn SessionDialListener>,
    upstream_node: bool,
    metrics: Arc<dyn MetricsProvider>,
    drain_timeout: Duration,
    state: Mutex<Lifecycle>,
}

impl Proxy {
    pub fn new(
        host_signers: Vec<PrivateKey>,
        session_service: Arc<dyn SessionService>,
        sshd_dial_listener: Arc<dyn SshdDialListener>,
        session_dial_listener: Arc<dyn SessionDialListener>,
    ) -> Self {
        Self {
            host_signers,
            session_service,
            sshd_dial_listener,
            session_dial_listener,
            upstream_node: false,
            metrics: Arc::new(NoopMetrics),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            state: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Treat upstreams as peer server nodes rather than host SSHDs,
    /// switching the auth-bridging policy accordingly.
    pub fn with_upstream_node(mut self, upstream_node: bool) -> Self {
        self.upstream_node = upstream_node;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, Lifecycle> {
        // The lock is only ever held to read or swap the lifecycle slot,
        // never across a network operation.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the routing surface on `listener` until shutdown. Single-shot:
    /// a second call while running is `AlreadyRunning`; a call after
    /// shutdown returns without accepting.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let routing = {
            let mut state = self.state();
            match &*state {
                Lifecycle::Running(_) => return Err(Error::AlreadyRunning),
                Lifecycle::Stopped => return Ok(()),
                Lifecycle::Idle => {
                    let finder = UpstreamFinder::new(
                        self.session_service.clone(),
                        self.sshd_dial_listener.clone(),
                        self.session_dial_listener.clone(),
                        self.upstream_node,
                    );
                    let routing = Arc::new(Routing::new(
                        self.host_signers.clone(),
                        finder,
                        self.metrics.clone(),
                        self.drain_timeout,
                    ));
                    *state = Lifecycle::Running(routing.clone());
                    routing
                }
            }
        };

        let result = routing.serve(listener).await;
        *self.state() = Lifecycle::Stopped;
        result
    }

    /// Stop accepting and drain in-flight connections. Idempotent; a
    /// no-op before `serve`.
    pub async fn shutdown(&self) -> Result<()> {
        let routing = match &*self.state() {
            Lifecycle::Running(routing) => Some(routing.clone()),
            _ => None,
        };
        if let Some(routing) = routing {
            routing.shutdown().await;
        }
        Ok(())
    }
}
