//! Shared harness for the integration suites: a scriptable provider, a
//! fixed-provider factory, and a router wired to temp-dir stores.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use llm_council::council::config::{ConfigStore, CouncilConfig, JsonConfigStore};
use llm_council::council::provider::{
    ChatMessage, ChunkStream, Completion, Provider, StreamChunk,
};
use llm_council::council::providers::ProviderFactory;
use llm_council::council::server::{router, AppState};
use llm_council::council::store::JsonFileStore;

/// Provider stub with one scripted response per model; unknown models fail.
pub struct ScriptedProvider {
    responses: HashMap<String, String>,
    local: bool,
}

impl ScriptedProvider {
    pub fn new(pairs: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            responses: pairs
                .into_iter()
                .map(|(m, r)| (m.to_string(), r.to_string()))
                .collect(),
            local: false,
        })
    }

    pub fn local(pairs: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            responses: pairs
                .into_iter()
                .map(|(m, r)| (m.to_string(), r.to_string()))
                .collect(),
            local: true,
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn complete(
        &self,
        model: &str,
        _messages: &[ChatMessage],
        _timeout: Duration,
    ) -> Option<Completion> {
        self.responses
            .get(model)
            .map(|text| Completion::new(text.clone()))
    }

    async fn stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> ChunkStream {
        match self.complete(model, &messages, timeout).await {
            Some(completion) => {
                let text = completion.content;
                let mid = text.len() / 2;
                let (a, b) = text.split_at(mid);
                Box::pin(futures_util::stream::iter(vec![
                    StreamChunk::Chunk {
                        content: a.to_string(),
                    },
                    StreamChunk::Chunk {
                        content: b.to_string(),
                    },
                    StreamChunk::Done { response: None },
                ]))
            }
            None => Box::pin(futures_util::stream::iter(vec![StreamChunk::Error {
                message: format!("model {} failed", model),
            }])),
        }
    }

    async fn list_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.responses.keys().cloned().collect();
        models.sort();
        models
    }
}

/// Factory that hands the same provider to every request.
pub struct FixedFactory(pub Arc<dyn Provider>);

impl ProviderFactory for FixedFactory {
    fn provider_for(&self, _hint: Option<&str>, _config: &CouncilConfig) -> Arc<dyn Provider> {
        self.0.clone()
    }
}

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub state: Arc<AppState>,
    pub app: axum::Router,
}

/// Router + state over temp-dir stores with the given provider and config.
pub async fn test_app(provider: Arc<dyn Provider>, config: CouncilConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config_store = Arc::new(JsonConfigStore::new(dir.path()));
    config_store.set(config).await.unwrap();
    let state = AppState::new(
        Arc::new(JsonFileStore::new(dir.path())),
        config_store,
        Arc::new(FixedFactory(provider)),
    );
    let app = router(state.clone());
    TestApp { dir, state, app }
}

/// Council config for tests: given members and chairman, no remote key.
pub fn council_config(models: &[&str], chairman: &str) -> CouncilConfig {
    let mut config = CouncilConfig::default();
    config.council_models = models.iter().map(|m| m.to_string()).collect();
    config.chairman_model = chairman.to_string();
    config.openrouter_api_key = String::new();
    config
}

/// A rater response that parses into `best` before `worst`.
pub fn ranking_text(best: char, worst: char) -> String {
    format!(
        "Solid answers overall.\n\nFINAL RANKING:\n1. Response {}\n2. Response {}",
        best, worst
    )
}

/// Issue one request and return status plus parsed JSON body.
pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let (status, text) = request_text(app, method, uri, body).await;
    let value = if text.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

/// Issue one request and return status plus raw body text.
pub async fn request_text(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, String) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// Extract the `type` field of every SSE `data:` frame, in order.
pub fn sse_event_types(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter_map(|frame| frame.trim().strip_prefix("data: ").map(|s| s.to_string()))
        .filter_map(|payload| serde_json::from_str::<serde_json::Value>(&payload).ok())
        .filter_map(|json| json["type"].as_str().map(|t| t.to_string()))
        .collect()
}
