//! Unix-socket dial listeners
//!
//! The in-process SSHD listens on one well-known socket; each registered
//! session's reverse tunnel listens on `<sessions-dir>/<id>.sock`. Both
//! dialers bound the connect with a timeout so a wedged upstream cannot
//! stall a downstream handshake indefinitely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tracing::trace;

use super::{BoxedStream, SessionDialListener, SshdDialListener};
use crate::error::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

async fn connect(path: &Path) -> std::io::Result<UnixStream> {
    tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(path))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))?
}

/// Dialer for the server-local in-process SSHD socket.
pub struct UnixSshdDialListener {
    path: PathBuf,
}

impl UnixSshdDialListener {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SshdDialListener for UnixSshdDialListener {
    async fn dial(&self) -> Result<BoxedStream> {
        let stream = connect(&self.path).await.map_err(|e| {
            Error::Unreachable(format!("sshd at {}: {}", self.path.display(), e))
        })?;
        trace!(path = %self.path.display(), "dialed sshd socket");
        Ok(Box::new(stream))
    }
}

/// Dialer for per-session reverse-tunnel sockets.
pub struct UnixSessionDialListener {
    sockets_dir: PathBuf,
}

impl UnixSessionDialListener {
    pub fn new<P: AsRef<Path>>(sockets_dir: P) -> Self {
        Self {
            sockets_dir: sockets_dir.as_ref().to_path_buf(),
        }
    }

    fn socket_path(&self, session_id: &str) -> Result<PathBuf> {
        // Session ids come off the wire; never let one traverse out of
        // the sockets directory.
        if session_id.is_empty()
            || session_id.contains('/')
            || session_id.contains('\\')
            || session_id == "."
            || session_id == ".."
        {
            return Err(Error::NotFound(session_id.to_string()));
        }
        Ok(self.sockets_dir.join(format!("{}.sock", session_id)))
    }
}

#[async_trait]
impl SessionDialListener for UnixSessionDialListener {
    async fn dial(&self, session_id: &str) -> Result<BoxedStream> {
        let path = self.socket_path(session_id)?;
        let stream = connect(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(session_id.to_string()),
            _ => Error::Unreachable(format!("session {} at {}: {}", session_id, path.display(), e)),
        })?;
        trace!(session = %session_id, path = %path.display(), "dialed session tunnel");
        Ok(Box::new(stream))
    }
}
