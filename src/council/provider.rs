//! Provider-agnostic primitives for talking to LLM backends.
//!
//! The orchestrator interacts with every backend through the [`Provider`]
//! trait: a uniform capability set of "complete a chat", "stream a chat",
//! and "enumerate models". Concrete adapters live in
//! [`providers`](crate::council::providers); the trait deliberately excludes
//! conversation bookkeeping, which belongs to the store and context manager.
//!
//! All implementations **must** be thread-safe (`Send + Sync`) so they can be
//! shared between async tasks behind an `Arc`.
//!
//! # Failure contract
//!
//! Adapters never raise for "model not found" or upstream errors:
//! [`Provider::complete`] resolves to `None` and [`Provider::stream`] yields a
//! terminal [`StreamChunk::Error`]. Callers decide whether a missing response
//! is fatal; the council tolerates any non-empty subset of its members.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::Stream;

/// Default per-call deadline for chat requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for conversation-title generation, which should stay snappy.
pub const TITLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
}

impl Role {
    /// Wire name used by every OpenAI-compatible chat API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat turn sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

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

/// A complete (non-streamed) model answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The assistant's full response text.
    pub content: String,
    /// Provider-reported reasoning trace, when the upstream exposes one.
    pub reasoning: Option<String>,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reasoning: None,
        }
    }
}

/// One element of a streamed model answer.
///
/// Adapters emit `Chunk`, `Done`, and `Error`; the `Start` demarcation is
/// added by the [`StreamMux`](crate::council::multiplexer::StreamMux) when it
/// labels and merges worker streams, so that every merged source announces
/// itself exactly once before its first chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// The labeled worker has begun producing.
    Start,
    /// An incremental content delta.
    Chunk { content: String },
    /// The worker terminated normally. `response` carries the full text when
    /// the producer already accumulated it (whole-response promotion).
    Done { response: Option<String> },
    /// The worker failed; terminal for that worker, isolated from the rest.
    Error { message: String },
}

impl StreamChunk {
    /// True for `Done` and `Error`; nothing follows either.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done { .. } | StreamChunk::Error { .. })
    }
}

/// Boxed chunk stream compatible with `Send` executors.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Trait defining the interface to interact with LLM backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used for routing and logging (`"openrouter"`,
    /// `"ollama"`, `"hybrid"`).
    fn name(&self) -> &str;

    /// Whether this provider serves locally installed models. Local providers
    /// get their council membership filtered against [`Provider::list_models`]
    /// and participate in chairman fallback.
    fn is_local(&self) -> bool {
        false
    }

    /// Send a full request/response style chat completion.
    ///
    /// Resolves to `None` on any upstream failure (timeout, HTTP error,
    /// unknown model). Implementations log the cause; they never panic or
    /// propagate an error for a single model's failure.
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<Completion>;

    /// Request a streaming response from the provider.
    ///
    /// Always returns a stream. Providers without upstream streaming support
    /// must promote the whole response to one `Chunk` followed by `Done`,
    /// keeping downstream consumers uniform. Failures surface as a terminal
    /// [`StreamChunk::Error`], never as a panic.
    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> ChunkStream;

    /// Enumerate locally installed or remotely offered model IDs.
    async fn list_models(&self) -> Vec<String>;
}
