//! Conversation history
//!
//! `ConversationHistoryStore` keeps every conversation in memory and hands
//! each mutation, in order, to a single background writer that calls the
//! `HistoryPersistence` collaborator. Persistence failures are logged and never
//! block the caller.

mod json_file;

pub use json_file::JsonFileHistory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Characters of the last message shown in conversation listings
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Errors raised by a persistence backend
#[derive(Debug, Clone)]
pub enum PersistError {
    Io(String),
    Format(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(e) => write!(f, "History I/O error: {}", e),
            PersistError::Format(e) => write!(f, "History format error: {}", e),
        }
    }
}

impl std::error::Error for PersistError {}

/// Durable storage behind the history store. Calls are blocking and are made
/// from the writer task via `spawn_blocking`, one at a time.
pub trait HistoryPersistence: Send + Sync + 'static {
    fn append(&self, conversation_id: &str, message: &Message) -> Result<(), PersistError>;

    fn load_all(&self) -> Result<HashMap<String, Vec<Message>>, PersistError>;

    fn remove(&self, _conversation_id: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Listing entry for a stored conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub message_count: usize,
    pub last_message: String,
}

enum WriteOp {
    Append { id: String, message: Message },
    Remove(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

pub struct ConversationHistoryStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl ConversationHistoryStore {
    /// Store without durable backing
    pub fn in_memory() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            writer: None,
        }
    }

    /// Initialize from `persistence.load_all()` and start the writer task.
    /// A failed load is logged and the store starts empty.
    pub async fn load(persistence: Arc<dyn HistoryPersistence>) -> Self {
        let loader = Arc::clone(&persistence);
        let initial = match tokio::task::spawn_blocking(move || loader.load_all()).await {
            Ok(Ok(map)) => map,
            Ok(Err(e)) => {
                log::error!("Failed to load chat history: {}", e);
                HashMap::new()
            }
            Err(e) => {
                log::error!("History load task failed: {}", e);
                HashMap::new()
            }
        };
        log::info!("Loaded chat history: {} conversations", initial.len());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(persistence, rx));

        Self {
            conversations: RwLock::new(initial),
            writer: Some(tx),
        }
    }

    /// Append a message. Visible to `snapshot` immediately; persisted in order.
    pub fn append(&self, conversation_id: &str, message: Message) {
        if let Ok(mut map) = self.conversations.write() {
            map.entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
        }
        self.send(WriteOp::Append {
            id: conversation_id.to_string(),
            message,
        });
    }

    /// Owned copy of a conversation; later appends do not affect it
    pub fn snapshot(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .ok()
            .and_then(|map| map.get(conversation_id).cloned())
            .unwrap_or_default()
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations
            .read()
            .map(|map| map.contains_key(conversation_id))
            .unwrap_or(false)
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        let Ok(map) = self.conversations.read() else {
            return Vec::new();
        };
        let mut summaries: Vec<_> = map
            .iter()
            .map(|(id, messages)| ConversationSummary {
                conversation_id: id.clone(),
                message_count: messages.len(),
                last_message: messages
                    .last()
                    .map(|m| preview(&m.content))
                    .unwrap_or_else(|| "No messages".to_string()),
            })
            .collect();
        summaries.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        summaries
    }

    /// Returns whether the conversation existed
    pub fn delete_conversation(&self, conversation_id: &str) -> bool {
        let removed = self
            .conversations
            .write()
            .map(|mut map| map.remove(conversation_id).is_some())
            .unwrap_or(false);
        if removed {
            self.send(WriteOp::Remove(conversation_id.to_string()));
        }
        removed
    }

    /// Returns the number of conversations removed
    pub fn clear_all(&self) -> usize {
        let count = self
            .conversations
            .write()
            .map(|mut map| {
                let n = map.len();
                map.clear();
                n
            })
            .unwrap_or(0);
        self.send(WriteOp::Clear);
        count
    }

    /// Wait until every queued write has reached the persistence backend
    pub async fn shutdown(&self) {
        let Some(writer) = &self.writer else { return };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        log::info!("Chat history flushed");
    }

    fn send(&self, op: WriteOp) {
        if let Some(writer) = &self.writer {
            if writer.send(op).is_err() {
                log::warn!("History writer is gone; change kept in memory only");
            }
        }
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        content.to_string()
    }
}

async fn run_writer(
    persistence: Arc<dyn HistoryPersistence>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        let backend = Arc::clone(&persistence);
        let result = match op {
            WriteOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            WriteOp::Append { id, message } => {
                tokio::task::spawn_blocking(move || backend.append(&id, &message)).await
            }
            WriteOp::Remove(id) => tokio::task::spawn_blocking(move || backend.remove(&id)).await,
            WriteOp::Clear => tokio::task::spawn_blocking(move || backend.clear()).await,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Failed to persist chat history: {}", e),
            Err(e) => log::error!("History write task failed: {}", e),
        }
    }
    log::debug!("History writer stopped");
}
