use crate::error::AdvisorResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Session used when a request does not name one
pub const DEFAULT_SESSION: &str = "demo";

/// Map a missing or blank session id to the default session
pub fn session_or_default(session_id: Option<&str>) -> String {
    match session_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_SESSION.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One exchange turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        TranscriptMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered per-session message storage.
///
/// An unknown session is a normal state: `get` returns an empty list and
/// `clear` does nothing.
#[async_trait]
pub trait TranscriptRepository: Send + Sync {
    /// Append to the end of the session, returning its new length
    async fn append(&self, session_id: &str, message: TranscriptMessage) -> AdvisorResult<usize>;

    /// Append several messages as one contiguous run
    async fn append_many(
        &self,
        session_id: &str,
        messages: Vec<TranscriptMessage>,
    ) -> AdvisorResult<usize>;

    async fn get(&self, session_id: &str) -> AdvisorResult<Vec<TranscriptMessage>>;

    async fn clear(&self, session_id: &str) -> AdvisorResult<()>;

    async fn session_count(&self) -> AdvisorResult<usize>;
}

/// Process-local transcripts; nothing survives a restart
#[derive(Debug, Default)]
pub struct InMemoryTranscripts {
    sessions: RwLock<HashMap<String, Vec<TranscriptMessage>>>,
}

impl InMemoryTranscripts {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptRepository for InMemoryTranscripts {
    async fn append(&self, session_id: &str, message: TranscriptMessage) -> AdvisorResult<usize> {
        let mut sessions = self.sessions.write().await;
        let messages = sessions.entry(session_id.to_string()).or_default();
        messages.push(message);
        Ok(messages.len())
    }

    async fn append_many(
        &self,
        session_id: &str,
        messages: Vec<TranscriptMessage>,
    ) -> AdvisorResult<usize> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.entry(session_id.to_string()).or_default();
        stored.extend(messages);
        Ok(stored.len())
    }

    async fn get(&self, session_id: &str) -> AdvisorResult<Vec<TranscriptMessage>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> AdvisorResult<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn session_count(&self) -> AdvisorResult<usize> {
        Ok(self.sessions.read().await.len())
    }
}
