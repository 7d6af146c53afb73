//! Serve command - run the rendezvous server

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, decode_secret_key};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::cli::args::ServeArgs;
use crate::config::Config;
use crate::dial::{UnixSessionDialListener, UnixSshdDialListener};
use crate::metrics::AtomicMetrics;
use crate::proxy::Proxy;
use crate::session::MemorySessionService;
use crate::utils::socket::restrict_dir;

/// Execute the serve command
pub async fn execute(config_path: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    // CLI flags win over the config file.
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(sshd_socket) = args.sshd_socket {
        config.sshd_socket = sshd_socket.to_string_lossy().into_owned();
    }
    if let Some(sessions_dir) = args.sessions_dir {
        config.sessions_dir = sessions_dir.to_string_lossy().into_owned();
    }
    if !args.host_keys.is_empty() {
        config.host_keys = args
            .host_keys
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
    }
    if args.upstream_node {
        config.upstream_node = true;
    }

    let config = config.expand()?;

    let host_signers = load_host_keys(&config.host_keys)?;

    std::fs::create_dir_all(&config.sessions_dir).with_context(|| {
        format!(
            "failed to create sessions directory {}",
            config.sessions_dir.display()
        )
    })?;
    restrict_dir(&config.sessions_dir)?;

    let sessions = Arc::new(MemorySessionService::new());
    let metrics = Arc::new(AtomicMetrics::new());
    let proxy = Arc::new(
        Proxy::new(
            host_signers,
            sessions,
            Arc::new(UnixSshdDialListener::new(&config.sshd_socket)),
            Arc::new(UnixSessionDialListener::new(&config.sessions_dir)),
        )
        .with_upstream_node(config.upstream_node)
        .with_metrics(metrics)
        .with_drain_timeout(config.drain_timeout),
    );

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        listen = %config.listen,
        sshd_socket = %config.sshd_socket.display(),
        sessions_dir = %config.sessions_dir.display(),
        upstream_node = config.upstream_node,
        "starting termshare server"
    );

    let serving = proxy.clone();
    let server = tokio::spawn(async move { serving.serve(listener).await });

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");
    proxy.shutdown().await?;
    server.await.context("server task panicked")??;

    Ok(())
}

fn load_host_keys(paths: &[PathBuf]) -> Result<Vec<PrivateKey>> {
    if paths.is_empty() {
        warn!("no host key configured, generating an ephemeral ed25519 key");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("failed to generate an ephemeral host key")?;
        return Ok(vec![key]);
    }

    paths
        .iter()
        .map(|path| {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read host key {}", path.display()))?;
            decode_secret_key(&raw, None)
                .with_context(|| format!("failed to parse host key {}", path.display()))
        })
        .collect()
}
