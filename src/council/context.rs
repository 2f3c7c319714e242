//! Bounded-window conversation context with summarization.
//!
//! Each turn gets the last `keep_recent` final answers verbatim. Once a
//! conversation outgrows that window, the older finals are compressed by the
//! chairman into a persisted summary message: synchronously when the window
//! overflows at prompt-build time, and in the background after a successful
//! turn once more than `summary_retention` real turns have accumulated. The
//! background pass is best-effort and never touches the foreground response.

use std::sync::Arc;
use std::time::Duration;

use crate::council::config::{IMMEDIATE_CONTEXT_KEEP, SUMMARY_RETENTION};
use crate::council::model::StoredMessage;
use crate::council::provider::{ChatMessage, Provider, DEFAULT_REQUEST_TIMEOUT};
use crate::council::store::{ConversationLocks, ConversationStore};

/// Result of building prior context for a turn.
#[derive(Debug, Clone, Default)]
pub struct PriorContext {
    /// Joined context text, or `None` for a fresh conversation.
    pub text: Option<String>,
    /// Whether this build already persisted a summary message; when set, the
    /// post-turn background pass must not write another.
    pub wrote_summary: bool,
}

/// Maintains the immediate context window and its summaries.
pub struct ContextManager {
    store: Arc<dyn ConversationStore>,
    locks: Arc<ConversationLocks>,
    keep_recent: usize,
    summary_retention: usize,
}

impl ContextManager {
    pub fn new(store: Arc<dyn ConversationStore>, locks: Arc<ConversationLocks>) -> Self {
        Self {
            store,
            locks,
            keep_recent: IMMEDIATE_CONTEXT_KEEP,
            summary_retention: SUMMARY_RETENTION,
        }
    }

    /// Override the window sizes (tests and tuning).
    pub fn with_limits(mut self, keep_recent: usize, summary_retention: usize) -> Self {
        self.keep_recent = keep_recent;
        self.summary_retention = summary_retention;
        self
    }

    /// Build the prior-context string for the next turn.
    ///
    /// With more finals than the window holds, the chairman is asked
    /// synchronously for a one-paragraph summary of the older ones; on
    /// success the summary is persisted and prepended, on failure the recent
    /// window alone is used.
    pub async fn build_prior_context(
        &self,
        conversation_id: &str,
        provider: &Arc<dyn Provider>,
        chairman: &str,
    ) -> PriorContext {
        let finals = match self.store.get(conversation_id).await {
            Some(conversation) => conversation.finals(),
            None => return PriorContext::default(),
        };

        if finals.is_empty() {
            return PriorContext::default();
        }

        if finals.len() <= self.keep_recent {
            return PriorContext {
                text: Some(finals.join("\n\n")),
                wrote_summary: false,
            };
        }

        let split = finals.len() - self.keep_recent;
        let older = &finals[..split];
        let recent = &finals[split..];

        let summary = self
            .summarize(older, provider, chairman, DEFAULT_REQUEST_TIMEOUT)
            .await;

        match summary {
            Some(summary_text) => {
                let persisted = self
                    .persist_summary(conversation_id, chairman, &summary_text, older.len())
                    .await;
                if persisted {
                    PriorContext {
                        text: Some(format!("{}\n\n{}", summary_text, recent.join("\n\n"))),
                        wrote_summary: true,
                    }
                } else {
                    PriorContext {
                        text: Some(recent.join("\n\n")),
                        wrote_summary: false,
                    }
                }
            }
            None => PriorContext {
                text: Some(recent.join("\n\n")),
                wrote_summary: false,
            },
        }
    }

    /// How many of the oldest finals the background pass should fold into a
    /// summary; zero when the conversation is within retention.
    pub async fn pending_summary_count(&self, conversation_id: &str) -> usize {
        match self.store.get(conversation_id).await {
            Some(conversation) => {
                let count = conversation.non_summary_final_count();
                count.saturating_sub(self.summary_retention)
            }
            None => 0,
        }
    }

    /// Background summarization: fold the oldest `num_to_summarize` finals
    /// into a persisted summary message. Best-effort; failures are logged
    /// and swallowed.
    pub async fn background_summarize(
        &self,
        conversation_id: &str,
        num_to_summarize: usize,
        provider: Arc<dyn Provider>,
        chairman: String,
    ) {
        if num_to_summarize == 0 {
            return;
        }

        let finals = match self.store.get(conversation_id).await {
            Some(conversation) => conversation.finals(),
            None => return,
        };
        if finals.is_empty() || num_to_summarize > finals.len() {
            return;
        }

        let to_summarize = &finals[..num_to_summarize];
        let summary = self
            .summarize(to_summarize, &provider, &chairman, DEFAULT_REQUEST_TIMEOUT)
            .await;

        match summary {
            Some(summary_text) => {
                if !self
                    .persist_summary(conversation_id, &chairman, &summary_text, num_to_summarize)
                    .await
                {
                    log::warn!(
                        "background summarize: conversation {} vanished before persist",
                        conversation_id
                    );
                }
            }
            None => {
                log::warn!(
                    "background summarize: chairman {} produced no summary for {}",
                    chairman,
                    conversation_id
                );
            }
        }
    }

    async fn summarize(
        &self,
        answers: &[String],
        provider: &Arc<dyn Provider>,
        chairman: &str,
        timeout: Duration,
    ) -> Option<String> {
        let prompt = summary_prompt(answers);
        let completion = provider
            .complete(chairman, &[ChatMessage::user(prompt)], timeout)
            .await?;
        let text = completion.content.trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Append a summary message under the conversation writer lock,
    /// re-reading the document so concurrent turn writes are preserved.
    async fn persist_summary(
        &self,
        conversation_id: &str,
        chairman: &str,
        summary_text: &str,
        summarized_count: usize,
    ) -> bool {
        let _guard = self.locks.acquire(conversation_id).await;
        let mut conversation = match self.store.get(conversation_id).await {
            Some(conversation) => conversation,
            None => return false,
        };
        conversation
            .messages
            .push(StoredMessage::summary(chairman, summary_text, summarized_count));
        match self.store.save(&conversation).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("persist_summary: save failed for {}: {}", conversation_id, e);
                false
            }
        }
    }
}

/// The chairman prompt asking for a one-paragraph compression of older
/// final answers.
pub fn summary_prompt(answers: &[String]) -> String {
    let mut prompt = String::from(
        "Summarize the following previous final answers into a concise paragraph \
         (one paragraph, keep it short):\n\n",
    );
    for (i, answer) in answers.iter().enumerate() {
        prompt.push_str(&format!("Answer {}: {}\n\n", i + 1, answer));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::council::model::ChairmanAnswer;
    use crate::council::provider::{ChunkStream, Completion};
    use crate::council::store::JsonFileStore;

    /// Chairman stub: counts calls, optionally refuses to answer.
    struct StubChairman {
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubChairman {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Provider for StubChairman {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _model: &str,
            messages: &[ChatMessage],
            _timeout: Duration,
        ) -> Option<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return None;
            }
            assert!(messages[0].content.starts_with("Summarize the following"));
            Some(Completion::new("condensed history"))
        }

        async fn stream(
            &self,
            _model: &str,
            _messages: Vec<ChatMessage>,
            _timeout: Duration,
        ) -> ChunkStream {
            Box::pin(futures_util::stream::iter(vec![]))
        }

        async fn list_models(&self) -> Vec<String> {
            Vec::new()
        }
    }

    async fn seeded_conversation(turns: usize) -> (tempfile::TempDir, Arc<JsonFileStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        store.create("c1").await.unwrap();
        for i in 0..turns {
            store.add_user_message("c1", &format!("q{}", i)).await.unwrap();
            store
                .add_assistant_message(
                    "c1",
                    vec![],
                    vec![],
                    ChairmanAnswer::new("m", format!("final{}", i)),
                )
                .await
                .unwrap();
        }
        (dir, store)
    }

    fn manager(store: Arc<JsonFileStore>) -> ContextManager {
        ContextManager::new(store, Arc::new(ConversationLocks::new())).with_limits(3, 3)
    }

    #[tokio::test]
    async fn test_empty_conversation_has_no_context() {
        let (_dir, store) = seeded_conversation(0).await;
        let manager = manager(store);
        let provider: Arc<dyn Provider> = StubChairman::new(false);
        let prior = manager.build_prior_context("c1", &provider, "chair").await;
        assert!(prior.text.is_none());
        assert!(!prior.wrote_summary);
    }

    #[tokio::test]
    async fn test_small_history_joins_without_summarizing() {
        let (_dir, store) = seeded_conversation(3).await;
        let manager = manager(store);
        let chairman = StubChairman::new(false);
        let provider: Arc<dyn Provider> = chairman.clone();
        let prior = manager.build_prior_context("c1", &provider, "chair").await;
        assert_eq!(prior.text.as_deref(), Some("final0\n\nfinal1\n\nfinal2"));
        assert!(!prior.wrote_summary);
        assert_eq!(chairman.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overflow_summarizes_and_persists() {
        let (_dir, store) = seeded_conversation(5).await;
        let manager = manager(store.clone());
        let provider: Arc<dyn Provider> = StubChairman::new(false);
        let prior = manager.build_prior_context("c1", &provider, "chair").await;

        assert!(prior.wrote_summary);
        assert_eq!(
            prior.text.as_deref(),
            Some("condensed history\n\nfinal2\n\nfinal3\n\nfinal4")
        );

        // The summary message landed in the document with the right tally.
        let conversation = store.get("c1").await.unwrap();
        let summary = conversation
            .messages
            .iter()
            .find(|m| m.is_summary())
            .expect("summary message persisted");
        match summary {
            StoredMessage::Assistant { stage3, .. } => {
                assert_eq!(
                    stage3.metadata.as_ref().unwrap().summarized_count,
                    Some(2)
                );
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back_to_recent() {
        let (_dir, store) = seeded_conversation(5).await;
        let manager = manager(store.clone());
        let provider: Arc<dyn Provider> = StubChairman::new(true);
        let prior = manager.build_prior_context("c1", &provider, "chair").await;

        assert!(!prior.wrote_summary);
        assert_eq!(prior.text.as_deref(), Some("final2\n\nfinal3\n\nfinal4"));
        assert!(!store
            .get("c1")
            .await
            .unwrap()
            .messages
            .iter()
            .any(|m| m.is_summary()));
    }

    #[tokio::test]
    async fn test_background_summary_trigger_counts_real_turns_only() {
        let (_dir, store) = seeded_conversation(4).await;
        let manager = manager(store.clone());
        assert_eq!(manager.pending_summary_count("c1").await, 1);

        let provider: Arc<dyn Provider> = StubChairman::new(false);
        manager
            .background_summarize("c1", 1, provider, "chair".to_string())
            .await;

        let conversation = store.get("c1").await.unwrap();
        let summaries: Vec<&StoredMessage> = conversation
            .messages
            .iter()
            .filter(|m| m.is_summary())
            .collect();
        assert_eq!(summaries.len(), 1);

        // The summary itself does not count toward the retention trigger.
        assert_eq!(manager.pending_summary_count("c1").await, 1);
    }

    #[tokio::test]
    async fn test_background_summarize_zero_is_noop() {
        let (_dir, store) = seeded_conversation(2).await;
        let manager = manager(store.clone());
        assert_eq!(manager.pending_summary_count("c1").await, 0);

        let chairman = StubChairman::new(false);
        let provider: Arc<dyn Provider> = chairman.clone();
        manager
            .background_summarize("c1", 0, provider, "chair".to_string())
            .await;
        assert_eq!(chairman.calls.load(Ordering::SeqCst), 0);
    }
}
