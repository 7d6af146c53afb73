//! Session registry
//!
//! A session is a host-registered shareable shell, keyed by its session
//! id. The registry is the lookup table the routing layer consults when a
//! client dials in. It is deliberately narrow (three operations) so that
//! an in-process map, a distributed store, and test mocks are
//! interchangeable.

mod memory;

pub use memory::MemorySessionService;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Descriptor of a live session.
///
/// Created when a host registers, destroyed when it disconnects or
/// unregisters. At most one live descriptor exists per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier, as embedded in connection identifiers.
    pub id: String,
    /// Address of the server node holding the host's tunnel.
    pub node_addr: String,
    /// Unix user the host agent runs as.
    pub host_user: String,
    /// When the host registered.
    pub created_at: DateTime<Utc>,
    /// The command the host shares.
    pub command: Vec<String>,
    /// Optional command forced on joining clients instead of attaching
    /// them to the host's own PTY.
    pub force_command: Vec<String>,
    /// `addr:port` clients should dial.
    pub host: String,
}

/// Registry of live sessions.
///
/// Consistency contract: a `get_session` that succeeds reflects a
/// `create_session` that succeeded, until the first `delete_session` for
/// that id. Lookups are O(1) amortized and safe for concurrent callers.
/// Registry operations are not linearized with in-flight connections; a
/// dial racing a delete may resolve either way.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Look up a session by id. `NotFound` if no live descriptor exists,
    /// `Unavailable` if the backing store cannot answer.
    async fn get_session(&self, id: &str) -> Result<Session>;

    /// Register a session. `Conflict` if the id is already live.
    async fn create_session(&self, session: Session) -> Result<()>;

    /// Remove a session. Idempotent.
    async fn delete_session(&self, id: &str) -> Result<()>;
}
