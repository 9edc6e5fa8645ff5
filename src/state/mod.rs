//! Session state
//!
//! Holds the execution context of each conversation between requests.
//! Contexts live only as long as the session; nothing is persisted.

use crate::context::{ContextSnapshot, ExecutionContext};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Context of the session, empty for a session never seen before.
    async fn load(&self, session_id: &str) -> Result<ExecutionContext>;
    async fn save(&self, session_id: &str, context: &ExecutionContext) -> Result<()>;
    /// Drop the session. Returns whether it existed.
    async fn end(&self, session_id: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Session {
    context: ExecutionContext,
    turns: u32,
    updated_at: DateTime<Utc>,
}

/// In-memory session store
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Number of saved turns and time of the last save.
    pub async fn activity(&self, session_id: &str) -> Option<(u32, DateTime<Utc>)> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| (s.turns, s.updated_at))
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<ContextSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.context.snapshot())
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<ExecutionContext> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|s| s.context.clone())
            .unwrap_or_default())
    }

    async fn save(&self, session_id: &str, context: &ExecutionContext) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| Session {
            context: ExecutionContext::new(),
            turns: 0,
            updated_at: Utc::now(),
        });
        session.context = context.clone();
        session.turns += 1;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn end(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(session_id).is_some())
    }
}
