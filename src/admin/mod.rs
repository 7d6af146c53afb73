//! Admin socket client
//!
//! Every host agent exposes a local unix socket with exactly one
//! operation: fetch the descriptor of the session it is hosting. The
//! server side of that socket lives in the host agent; this module holds
//! the wire form and the client the CLI uses.
//!
//! The protocol is one request line (`get-session`) answered by one JSON
//! line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::trace;

use crate::error::{Error, Result};
use crate::session::Session;

/// Environment variable naming the admin socket of the currently-hosted
/// session. Set by the host agent when a session is shared.
pub const ADMIN_SOCKET_ENV_VAR: &str = "TERMSHARE_ADMIN_SOCKET";

/// Request line understood by the admin socket.
pub const GET_SESSION_REQUEST: &str = "get-session";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Session descriptor as exchanged with admin clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub session_id: String,
    /// `addr:port` clients dial.
    pub host: String,
    pub node_addr: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub force_command: Vec<String>,
    pub ssh_user: String,
}

impl From<&Session> for SessionPayload {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            host: session.host.clone(),
            node_addr: session.node_addr.clone(),
            command: session.command.clone(),
            force_command: session.force_command.clone(),
            ssh_user: session.host_user.clone(),
        }
    }
}

/// Path of the admin socket for a named session under the base directory.
pub fn admin_socket_file<P: AsRef<Path>>(base_dir: P, name: &str) -> PathBuf {
    base_dir.as_ref().join(name).join("admin.sock")
}

/// Client for one host agent's admin socket.
pub struct AdminClient {
    socket_path: PathBuf,
}

impl AdminClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Fetch the hosted session's descriptor.
    pub async fn get_session(&self) -> Result<SessionPayload> {
        let payload = tokio::time::timeout(REQUEST_TIMEOUT, self.request()).await.map_err(
            |_| Error::Admin(format!("{}: request timed out", self.socket_path.display())),
        )??;
        Ok(payload)
    }

    async fn request(&self) -> Result<SessionPayload> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Admin(format!("{}: {}", self.socket_path.display(), e))
        })?;
        trace!(path = %self.socket_path.display(), "connected to admin socket");

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(format!("{}\n", GET_SESSION_REQUEST).as_bytes())
            .await?;
        writer.flush().await?;

        let mut line = String::new();
        let mut reader = BufReader::new(reader);
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::Admin(format!(
                "{}: admin socket closed without a response",
                self.socket_path.display()
            )));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
