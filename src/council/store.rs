//! Conversation persistence.
//!
//! Conversations are stored one JSON document per file under a data
//! directory. The store itself performs plain read-modify-write cycles;
//! callers that mutate (request handlers, background summarization) serialize
//! per conversation through [`ConversationLocks`] so that message order and
//! status transitions stay consistent. Readers never take the lock and may
//! observe a mid-flight turn (a trailing user message with no assistant
//! reply yet).

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::council::model::{
    ChairmanAnswer, Conversation, ConversationSummary, ModelRanking, ModelResponse,
    StoredMessage, UserStatus,
};

/// Errors from conversation persistence.
#[derive(Debug)]
pub enum StoreError {
    /// The conversation does not exist.
    NotFound(String),
    /// Filesystem or serialization trouble.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "conversation {} not found", id),
            StoreError::Io(msg) => write!(f, "storage error: {}", msg),
        }
    }
}

impl Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Advisory per-conversation writer locks.
///
/// One mutex per conversation ID, created on demand. Everything that mutates
/// a conversation (turn handlers, retry, status endpoints, background
/// summarization) acquires the lock for the read-modify-write section.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the writer lock for `conversation_id`, waiting if another
    /// writer holds it.
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Port over the conversation document store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create and persist a fresh conversation.
    async fn create(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Load a conversation; `None` when missing or unreadable.
    async fn get(&self, id: &str) -> Option<Conversation>;

    /// Total replace of the stored document.
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Metadata for every stored conversation, newest first. Malformed files
    /// are skipped, not fatal.
    async fn list(&self) -> Vec<ConversationSummary>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Append a pending user message.
    async fn add_user_message(&self, id: &str, content: &str) -> Result<(), StoreError>;

    /// Append an assistant turn. In the same write, the most recent pending
    /// user message transitions to `complete`, unless the appended turn is a
    /// summary, which never resolves a user message.
    async fn add_assistant_message(
        &self,
        id: &str,
        stage1: Vec<ModelResponse>,
        stage2: Vec<ModelRanking>,
        stage3: ChairmanAnswer,
    ) -> Result<(), StoreError>;

    /// Set the status of the most recent user message. Returns whether a
    /// user message existed.
    async fn mark_last_user_message_status(
        &self,
        id: &str,
        status: UserStatus,
    ) -> Result<bool, StoreError>;

    /// Remove pending user messages, optionally preserving the most recent
    /// one. Returns the number removed.
    async fn remove_pending_user_messages(
        &self,
        id: &str,
        keep_last: bool,
    ) -> Result<usize, StoreError>;

    /// The most recent user message, if any.
    async fn get_last_user_message(&self, id: &str) -> Option<StoredMessage>;

    async fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError>;
}

/// JSON-file implementation: `<data_dir>/<conversation_id>.json`.
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", id))
    }

    fn ensure_data_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    fn write_document(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.ensure_data_dir()?;
        let text = serde_json::to_string_pretty(conversation)?;
        std::fs::write(self.path_for(&conversation.id), text)?;
        Ok(())
    }

    fn read_document(&self, id: &str) -> Option<Conversation> {
        // config.json shares the directory; it is not a conversation.
        if id == "config" {
            return None;
        }
        let path = self.path_for(id);
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                log::warn!("JsonFileStore: unreadable {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Read, mutate, persist. The caller holds the conversation lock.
    fn update<F, T>(&self, id: &str, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Conversation) -> T,
    {
        let mut conversation = self
            .read_document(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let out = mutate(&mut conversation);
        self.write_document(&conversation)?;
        Ok(out)
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn create(&self, id: &str) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new(id);
        self.write_document(&conversation)?;
        Ok(conversation)
    }

    async fn get(&self, id: &str) -> Option<Conversation> {
        self.read_document(id)
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.write_document(conversation)
    }

    async fn list(&self) -> Vec<ConversationSummary> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") || name == "config.json" {
                continue;
            }
            let id = name.trim_end_matches(".json");
            match self.read_document(id) {
                Some(conversation) => summaries.push(ConversationSummary {
                    id: conversation.id.clone(),
                    created_at: conversation.created_at,
                    title: conversation.title.clone(),
                    message_count: conversation.message_count(),
                }),
                None => {
                    log::warn!("JsonFileStore::list: skipping invalid file {}", name);
                }
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn add_user_message(&self, id: &str, content: &str) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            // Only one user message may be pending at a time; an older
            // pending turn that never resolved is failed by the new send.
            for message in conversation.messages.iter_mut() {
                if let StoredMessage::User {
                    status,
                    status_updated_at,
                    ..
                } = message
                {
                    if *status == Some(UserStatus::Pending) {
                        *status = Some(UserStatus::Failed);
                        *status_updated_at = Some(chrono::Utc::now());
                    }
                }
            }
            conversation.messages.push(StoredMessage::user(content));
        })
    }

    async fn add_assistant_message(
        &self,
        id: &str,
        stage1: Vec<ModelResponse>,
        stage2: Vec<ModelRanking>,
        stage3: ChairmanAnswer,
    ) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            let message = StoredMessage::assistant(stage1, stage2, stage3);
            let resolves_user = !message.is_summary();
            conversation.messages.push(message);
            if resolves_user {
                // Same-write status flip for the turn's user message. Covers
                // both the fresh pending message and a failed one being
                // retried.
                for message in conversation.messages.iter_mut().rev() {
                    if let StoredMessage::User {
                        status,
                        status_updated_at,
                        ..
                    } = message
                    {
                        if *status != Some(UserStatus::Complete) {
                            *status = Some(UserStatus::Complete);
                            *status_updated_at = Some(chrono::Utc::now());
                        }
                        break;
                    }
                }
            }
        })
    }

    async fn mark_last_user_message_status(
        &self,
        id: &str,
        new_status: UserStatus,
    ) -> Result<bool, StoreError> {
        self.update(id, |conversation| {
            for message in conversation.messages.iter_mut().rev() {
                if let StoredMessage::User {
                    status,
                    status_updated_at,
                    ..
                } = message
                {
                    if *status != Some(new_status) {
                        *status = Some(new_status);
                        *status_updated_at = Some(chrono::Utc::now());
                    }
                    return true;
                }
            }
            false
        })
    }

    async fn remove_pending_user_messages(
        &self,
        id: &str,
        keep_last: bool,
    ) -> Result<usize, StoreError> {
        self.update(id, |conversation| {
            let pending: Vec<usize> = conversation
                .messages
                .iter()
                .enumerate()
                .filter(|(_, m)| {
                    matches!(
                        m,
                        StoredMessage::User {
                            status: Some(UserStatus::Pending),
                            ..
                        }
                    )
                })
                .map(|(i, _)| i)
                .collect();

            let keep_index = if keep_last { pending.last().copied() } else { None };
            let mut removed = 0;
            for index in pending.into_iter().rev() {
                if Some(index) == keep_index {
                    continue;
                }
                conversation.messages.remove(index);
                removed += 1;
            }
            removed
        })
    }

    async fn get_last_user_message(&self, id: &str) -> Option<StoredMessage> {
        let conversation = self.read_document(id)?;
        conversation
            .messages
            .into_iter()
            .rev()
            .find(|m| m.is_user())
    }

    async fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        self.update(id, |conversation| {
            conversation.title = title.to_string();
        })
    }
}
