//! OpenRouter gateway adapter.
//!
//! Talks to any OpenAI-compatible chat-completions endpoint with a bearer
//! key. The gateway returns whole responses only, so [`Provider::stream`] is
//! the single-chunk promotion of [`Provider::complete`].

use std::time::Duration;

use async_trait::async_trait;

use crate::council::config::CouncilConfig;
use crate::council::provider::{ChatMessage, ChunkStream, Completion, Provider};
use crate::council::providers::common::{get_shared_http_client, promote_completion};

/// Client for an OpenRouter-style chat completions API.
pub struct OpenRouterClient {
    /// Full URL of the chat completions endpoint
    /// (e.g. `https://openrouter.ai/api/v1/chat/completions`).
    api_url: String,
    /// Bearer key; requests are refused upstream without one.
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Construct from the persisted council configuration.
    pub fn from_config(config: &CouncilConfig) -> Self {
        Self::new(&config.openrouter_api_url, &config.openrouter_api_key)
    }

    /// The sibling `/models` endpoint of the configured completions URL.
    fn models_url(&self) -> String {
        if self.api_url.contains("/chat/completions") {
            self.api_url.replace("/chat/completions", "/models")
        } else {
            format!("{}/models", self.api_url.trim_end_matches('/'))
        }
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<Completion> {
        if self.api_key.is_empty() {
            log::error!("OpenRouterClient::complete: API key not configured");
            return None;
        }

        let body = serde_json::json!({
            "model": model,
            "messages": Self::wire_messages(messages),
        });

        let response = get_shared_http_client()
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                log::warn!("OpenRouterClient::complete: {} failed: {}", model, e);
                return None;
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                log::warn!("OpenRouterClient::complete: {} body read failed: {}", model, e);
                return None;
            }
        };

        if !status.is_success() {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!(
                    "OpenRouterClient::complete: HTTP {} for {}: {}",
                    status,
                    model,
                    text
                );
            }
            return None;
        }

        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("OpenRouterClient::complete: {} bad JSON: {}", model, e);
                return None;
            }
        };

        let message = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let reasoning = message
            .get("reasoning_details")
            .filter(|r| !r.is_null())
            .map(|r| r.to_string());

        Some(Completion { content, reasoning })
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> ChunkStream {
        // The gateway only returns whole responses; promote to one chunk.
        let result = self.complete(model, &messages, timeout).await;
        promote_completion(result, model)
    }

    async fn list_models(&self) -> Vec<String> {
        if self.api_key.is_empty() {
            log::error!("OpenRouterClient::list_models: API key not configured");
            return Vec::new();
        }

        let response = get_shared_http_client()
            .get(self.models_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(Duration::from_secs(30))
            .send()
            .await;

        let parsed: serde_json::Value = match response {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("OpenRouterClient::list_models: bad JSON: {}", e);
                    return Vec::new();
                }
            },
            Ok(r) => {
                log::warn!("OpenRouterClient::list_models: HTTP {}", r.status());
                return Vec::new();
            }
            Err(e) => {
                log::warn!("OpenRouterClient::list_models: {}", e);
                return Vec::new();
            }
        };

        // The gateway returns { "data": [ { "id": "ns/model", ... }, ... ] }.
        let mut models: Vec<String> = parsed
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_models_url_derivation() {
        let client = OpenRouterClient::new("https://openrouter.ai/api/v1/chat/completions", "k");
        assert_eq!(client.models_url(), "https://openrouter.ai/api/v1/models");

        let bare = OpenRouterClient::new("http://localhost:9999/v1", "k");
        assert_eq!(bare.models_url(), "http://localhost:9999/v1/models");
    }

    #[tokio::test]
    async fn test_complete_without_key_returns_none() {
        let client = OpenRouterClient::new("http://localhost:1/v1/chat/completions", "");
        let result = client
            .complete(
                "openai/gpt-5.1",
                &[ChatMessage::user("hi")],
                Duration::from_secs(1),
            )
            .await;
        assert!(result.is_none());
    }

    #[test]
    fn test_wire_messages_shape() {
        let wire = OpenRouterClient::wire_messages(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["content"], "hi");
    }
}
