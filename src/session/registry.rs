//! Process-wide registry of live sessions

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Shared view of a live session
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    conversation_id: String,
    created_at: DateTime<Utc>,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            created_at: Utc::now(),
            token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Ask the session to close. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its handle
    pub fn register(&self, id: &str, conversation_id: &str) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(id, conversation_id));
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.insert(id.to_string(), Arc::clone(&handle)).is_some() {
                log::warn!("Session {} was already registered; replaced", id);
            }
            log::info!("Registered session {} ({} active)", id, sessions.len());
        }
        handle
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().ok()?.get(id).cloned()
    }

    /// Remove a session. Returns the handle only to the first caller.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.write().ok()?.remove(id);
        if removed.is_some() {
            log::info!("Removed session {}", id);
        }
        removed
    }

    /// Ids of live sessions
    pub fn list(&self) -> Vec<String> {
        self.sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every live session to close. Entries are removed by the
    /// sessions themselves as they shut down.
    pub fn close_all(&self) -> usize {
        let handles: Vec<_> = self
            .sessions
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }
}
