// src/council/providers/mod.rs

pub mod common;
pub mod hybrid;
pub mod ollama;
pub mod openrouter;

use std::sync::Arc;

use crate::council::config::CouncilConfig;
use crate::council::provider::Provider;

pub use hybrid::HybridProvider;
pub use ollama::OllamaClient;
pub use openrouter::OpenRouterClient;

/// Builds provider adapters for a request.
///
/// The indirection exists so the HTTP layer can be exercised with mock
/// providers in tests; production uses [`DefaultProviderFactory`].
pub trait ProviderFactory: Send + Sync {
    /// Resolve the provider for a request. `hint` is the per-request override
    /// from the body/query; the configured provider applies otherwise.
    fn provider_for(&self, hint: Option<&str>, config: &CouncilConfig) -> Arc<dyn Provider>;
}

/// Production factory: `"ollama"`/`"local"` → local runtime, `"hybrid"` →
/// name-routed composite, anything else → the remote gateway.
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn provider_for(&self, hint: Option<&str>, config: &CouncilConfig) -> Arc<dyn Provider> {
        let name = hint
            .map(|h| h.to_string())
            .unwrap_or_else(|| config.provider.clone());
        match name.to_lowercase().as_str() {
            "ollama" | "local" => Arc::new(OllamaClient::from_env()),
            "hybrid" => Arc::new(HybridProvider::new(
                Arc::new(OpenRouterClient::from_config(config)),
                Arc::new(OllamaClient::from_env()),
            )),
            _ => Arc::new(OpenRouterClient::from_config(config)),
        }
    }
}
