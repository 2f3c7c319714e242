//! Name-routed composite provider.
//!
//! Routes `"namespace/model"` identifiers to the remote gateway and bare
//! names to the local runtime, so a single council can mix hosted frontier
//! models with locally installed ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::council::provider::{ChatMessage, ChunkStream, Completion, Provider};

/// Returns true when a model identifier looks like a remote gateway model
/// (`ns/model`); a leading slash does not count.
pub fn is_remote_model(model: &str) -> bool {
    model.contains('/') && !model.starts_with('/')
}

/// Composite provider dispatching per model name.
pub struct HybridProvider {
    remote: Arc<dyn Provider>,
    local: Arc<dyn Provider>,
}

impl HybridProvider {
    pub fn new(remote: Arc<dyn Provider>, local: Arc<dyn Provider>) -> Self {
        Self { remote, local }
    }

    fn route(&self, model: &str) -> &Arc<dyn Provider> {
        if is_remote_model(model) {
            &self.remote
        } else {
            &self.local
        }
    }
}

#[async_trait]
impl Provider for HybridProvider {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<Completion> {
        self.route(model).complete(model, messages, timeout).await
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> ChunkStream {
        self.route(model).stream(model, messages, timeout).await
    }

    async fn list_models(&self) -> Vec<String> {
        let mut models = self.remote.list_models().await;
        models.extend(self.local.list_models().await);
        models
    }
}
