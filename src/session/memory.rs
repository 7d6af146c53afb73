//! In-memory session registry

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Session, SessionService};
use crate::error::{Error, Result};

/// Registry backed by a process-local map. State dies with the process.
#[derive(Default)]
pub struct MemorySessionService {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionService for MemorySessionService {
    async fn get_session(&self, id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn create_session(&self, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(Error::Conflict(session.id));
        }
        debug!(session = %session.id, host_user = %session.host_user, "session registered");
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        if self.sessions.write().await.remove(id).is_some() {
            debug!(session = %id, "session removed");
        }
        Ok(())
    }
}
