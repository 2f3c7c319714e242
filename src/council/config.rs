//! Council configuration and its persistence.
//!
//! A small process-wide document selects the provider, the council member
//! list, and the chairman. Reads are cached; writes go through
//! [`ConfigStore::set`], which persists and invalidates the cache.

use std::error::Error;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// How many recent final answers stay verbatim in the prompt context.
pub const IMMEDIATE_CONTEXT_KEEP: usize = 3;

/// How many non-summary turns may accumulate before background
/// summarization kicks in.
pub const SUMMARY_RETENTION: usize = 3;

/// Default council members (remote gateway identifiers).
pub const DEFAULT_COUNCIL_MODELS: &[&str] = &[
    "openai/gpt-5.1",
    "google/gemini-3-pro-preview",
    "anthropic/claude-sonnet-4.5",
    "x-ai/grok-4",
];

/// Default chairman: synthesizes the final answer and writes summaries.
pub const DEFAULT_CHAIRMAN_MODEL: &str = "google/gemini-3-pro-preview";

/// Default remote gateway endpoint.
pub const DEFAULT_OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Model used for conversation titles on the remote gateway; the local
/// provider substitutes its first installed model.
pub const DEFAULT_TITLE_MODEL: &str = "google/gemini-2.5-flash";

fn default_api_url() -> String {
    DEFAULT_OPENROUTER_API_URL.to_string()
}

/// The persisted council settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Active provider: `"openrouter"`, `"ollama"`, or `"hybrid"`.
    pub provider: String,
    pub council_models: Vec<String>,
    pub chairman_model: String,
    #[serde(default)]
    pub openrouter_api_key: String,
    #[serde(default = "default_api_url")]
    pub openrouter_api_url: String,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            council_models: DEFAULT_COUNCIL_MODELS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            chairman_model: DEFAULT_CHAIRMAN_MODEL.to_string(),
            openrouter_api_key: std::env::var("OPENROUTER_API_KEY").unwrap_or_default(),
            openrouter_api_url: default_api_url(),
        }
    }
}

/// Partial update accepted by the config endpoint; absent fields keep their
/// current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub provider: Option<String>,
    pub council_models: Option<Vec<String>>,
    pub chairman_model: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_api_url: Option<String>,
}

impl CouncilConfig {
    /// Apply a partial update in place.
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(provider) = update.provider {
            self.provider = provider;
        }
        if let Some(models) = update.council_models {
            self.council_models = models;
        }
        if let Some(chairman) = update.chairman_model {
            self.chairman_model = chairman;
        }
        if let Some(key) = update.openrouter_api_key {
            self.openrouter_api_key = key;
        }
        if let Some(url) = update.openrouter_api_url {
            self.openrouter_api_url = url;
        }
    }
}

/// Process-wide configuration access.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> CouncilConfig;
    async fn set(&self, config: CouncilConfig) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// File-backed [`ConfigStore`]: `config.json` under the data directory,
/// created lazily with defaults, cached in memory between writes.
pub struct JsonConfigStore {
    path: PathBuf,
    cache: RwLock<Option<CouncilConfig>>,
}

impl JsonConfigStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join("config.json"),
            cache: RwLock::new(None),
        }
    }

    fn load_or_default(&self) -> CouncilConfig {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!(
                        "JsonConfigStore: malformed {}: {}; using defaults",
                        self.path.display(),
                        e
                    );
                    CouncilConfig::default()
                }
            },
            Err(_) => {
                let config = CouncilConfig::default();
                if let Err(e) = self.persist(&config) {
                    log::warn!("JsonConfigStore: could not seed config: {}", e);
                }
                config
            }
        }
    }

    fn persist(&self, config: &CouncilConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn get(&self) -> CouncilConfig {
        if let Some(config) = self.cache.read().await.clone() {
            return config;
        }
        let config = self.load_or_default();
        *self.cache.write().await = Some(config.clone());
        config
    }

    async fn set(&self, config: CouncilConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.persist(&config)?;
        *self.cache.write().await = Some(config);
        Ok(())
    }
}
