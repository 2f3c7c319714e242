//! Local Ollama runtime adapter.
//!
//! Streams real incremental tokens: `/api/chat` with `stream: true` returns
//! one JSON object per line, each carrying a `message.content` delta and a
//! final `done: true` marker. Model enumeration reads `/api/tags`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::council::provider::{ChatMessage, ChunkStream, Completion, Provider, StreamChunk};
use crate::council::providers::common::{error_stream, get_shared_http_client};

/// Default host for a local Ollama server.
pub const DEFAULT_OLLAMA_API_URL: &str = "http://localhost:11434";

/// Client for a local Ollama instance.
pub struct OllamaClient {
    host_root: String,
}

impl OllamaClient {
    pub fn new(host_root: impl Into<String>) -> Self {
        let host_root: String = host_root.into();
        Self {
            host_root: host_root.trim_end_matches('/').to_string(),
        }
    }

    /// Construct from `OLLAMA_API_URL`, falling back to the default host.
    pub fn from_env() -> Self {
        let url = std::env::var("OLLAMA_API_URL")
            .unwrap_or_else(|_| DEFAULT_OLLAMA_API_URL.to_string());
        Self::new(url)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.host_root)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.host_root)
    }

    fn chat_body(model: &str, messages: &[ChatMessage], stream: bool) -> serde_json::Value {
        let wire: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        serde_json::json!({ "model": model, "messages": wire, "stream": stream })
    }
}

#[async_trait]
impl Provider for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Option<Completion> {
        let response = get_shared_http_client()
            .post(self.chat_url())
            .json(&Self::chat_body(model, messages, false))
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                log::warn!("OllamaClient::complete: {} failed: {}", model, e);
                return None;
            }
        };

        if !response.status().is_success() {
            log::warn!(
                "OllamaClient::complete: HTTP {} for {}",
                response.status(),
                model
            );
            return None;
        }

        let parsed: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("OllamaClient::complete: {} bad JSON: {}", model, e);
                return None;
            }
        };

        if let Some(err) = parsed.get("error").and_then(|e| e.as_str()) {
            log::warn!("OllamaClient::complete: {}: {}", model, err);
            return None;
        }

        let content = parsed
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())?
            .to_string();

        Some(Completion {
            content,
            reasoning: None,
        })
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> ChunkStream {
        let response = get_shared_http_client()
            .post(self.chat_url())
            .json(&Self::chat_body(model, &messages, true))
            .timeout(timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return error_stream(format!("{}: {}", model, e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return error_stream(format!("{}: HTTP {} {}", model, status, text));
        }

        let mut byte_stream = response.bytes_stream();
        Box::pin(async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            while let Some(next) = byte_stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        yield StreamChunk::Error { message: format!("stream read failed: {}", e) };
                        return;
                    }
                };
                buf.extend_from_slice(&bytes);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let text = match std::str::from_utf8(&line) {
                        Ok(t) => t.trim(),
                        Err(_) => continue,
                    };
                    if text.is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = match serde_json::from_str(text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
                        yield StreamChunk::Error { message: err.to_string() };
                        return;
                    }
                    if let Some(content) = value
                        .get("message")
                        .and_then(|m| m.get("content"))
                        .and_then(|c| c.as_str())
                    {
                        if !content.is_empty() {
                            yield StreamChunk::Chunk { content: content.to_string() };
                        }
                    }
                    if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                        yield StreamChunk::Done { response: None };
                        return;
                    }
                }
            }
            // Server closed the connection without a done marker; the worker
            // still terminated normally from the consumer's point of view.
            yield StreamChunk::Done { response: None };
        })
    }

    async fn list_models(&self) -> Vec<String> {
        let response = get_shared_http_client()
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        let parsed: serde_json::Value = match response {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("OllamaClient::list_models: bad JSON: {}", e);
                    return Vec::new();
                }
            },
            Ok(r) => {
                log::warn!("OllamaClient::list_models: HTTP {}", r.status());
                return Vec::new();
            }
            Err(e) => {
                log::debug!("OllamaClient::list_models: {}", e);
                return Vec::new();
            }
        };

        // /api/tags returns { "models": [ { "name": "llama3.2:latest", ... } ] }
        parsed
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.get("name").and_then(|n| n.as_str()))
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}
