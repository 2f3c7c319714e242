//! Conversation document model.
//!
//! A conversation is an append-only sequence of messages: user turns with a
//! delivery status, and assistant turns carrying the three council stages. A
//! *summary message* is an assistant turn whose only purpose is to compress a
//! window of older final answers; it has empty stage 1/2 and a
//! `summarized_count` in its stage-3 metadata, and is excluded from the
//! completed-assistant tallies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One council member's stage-1 answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model: String,
    pub response: String,
}

/// One council member's stage-2 ranking: the full prose plus the parsed
/// label order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRanking {
    pub model: String,
    pub ranking: String,
    #[serde(default)]
    pub parsed_ranking: Vec<String>,
}

/// Metadata attached to a chairman answer. Populated for summary messages;
/// absent on ordinary turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChairmanMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chairman_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_generated_at: Option<DateTime<Utc>>,
}

/// The stage-3 synthesis: the canonical answer of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChairmanAnswer {
    pub model: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChairmanMetadata>,
}

impl ChairmanAnswer {
    pub fn new(model: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            response: response.into(),
            metadata: None,
        }
    }

    /// True when this answer is a context summary rather than a real turn.
    pub fn is_summary(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.summarized_count)
            .map(|n| n > 0)
            .unwrap_or(false)
    }
}

/// Delivery status of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Complete,
    Failed,
}

impl UserStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UserStatus::Pending),
            "complete" => Some(UserStatus::Complete),
            "failed" => Some(UserStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Complete => "complete",
            UserStatus::Failed => "failed",
        }
    }
}

/// A message in a conversation, tagged by role on the wire.
///
/// `status` is optional on user messages so documents written before status
/// tracking still deserialize; a missing status is treated as complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum StoredMessage {
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<UserStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_updated_at: Option<DateTime<Utc>>,
    },
    Assistant {
        #[serde(default)]
        stage1: Vec<ModelResponse>,
        #[serde(default)]
        stage2: Vec<ModelRanking>,
        stage3: ChairmanAnswer,
    },
}

impl StoredMessage {
    /// A fresh user message, created pending until its turn resolves.
    pub fn user(content: impl Into<String>) -> Self {
        StoredMessage::User {
            content: content.into(),
            status: Some(UserStatus::Pending),
            created_at: Some(Utc::now()),
            status_updated_at: None,
        }
    }

    pub fn assistant(
        stage1: Vec<ModelResponse>,
        stage2: Vec<ModelRanking>,
        stage3: ChairmanAnswer,
    ) -> Self {
        StoredMessage::Assistant {
            stage1,
            stage2,
            stage3,
        }
    }

    /// An assistant message that compresses `summarized_count` older finals.
    pub fn summary(
        model: impl Into<String>,
        text: impl Into<String>,
        summarized_count: usize,
    ) -> Self {
        let model = model.into();
        StoredMessage::Assistant {
            stage1: Vec::new(),
            stage2: Vec::new(),
            stage3: ChairmanAnswer {
                model: model.clone(),
                response: text.into(),
                metadata: Some(ChairmanMetadata {
                    summarized_count: Some(summarized_count),
                    chairman_model: Some(model),
                    summary_generated_at: Some(Utc::now()),
                }),
            },
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, StoredMessage::User { .. })
    }

    pub fn is_summary(&self) -> bool {
        match self {
            StoredMessage::Assistant { stage3, .. } => stage3.is_summary(),
            _ => false,
        }
    }

    /// The final answer text of an assistant message, when non-empty.
    pub fn final_response(&self) -> Option<&str> {
        match self {
            StoredMessage::Assistant { stage3, .. } if !stage3.response.is_empty() => {
                Some(stage3.response.as_str())
            }
            _ => None,
        }
    }

    /// The status of a user message; `None` for assistant messages.
    pub fn user_status(&self) -> Option<UserStatus> {
        match self {
            // Missing status means the document predates status tracking.
            StoredMessage::User { status, .. } => Some(status.unwrap_or(UserStatus::Complete)),
            _ => None,
        }
    }
}

/// Default title for conversations that have not been named yet.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// A persisted conversation: identity, title, and the ordered message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            messages: Vec::new(),
        }
    }

    /// All final answers in chronological order, summaries included: a
    /// summary's text feeds back into later context windows.
    pub fn finals(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| m.final_response().map(|s| s.to_string()))
            .collect()
    }

    /// Completed turns only: assistant messages with a non-empty final that
    /// are not summaries.
    pub fn non_summary_final_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.final_response().is_some() && !m.is_summary())
            .count()
    }

    /// Message count reported by the list view: user messages that completed
    /// (or predate status tracking) plus non-summary assistant turns.
    pub fn message_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| match m {
                StoredMessage::User { .. } => m.user_status() == Some(UserStatus::Complete),
                StoredMessage::Assistant { .. } => {
                    m.final_response().is_some() && !m.is_summary()
                }
            })
            .count()
    }
}

/// Conversation metadata for the list view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub message_count: usize,
}
