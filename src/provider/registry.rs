//! Config-backed adapter registry.
//!
//! A model key is resolved to its provider once; the adapter is cached and
//! shared by every later submission, poll and extraction for that key.
//! Resolution errors (unknown key, missing credentials) stay scoped to the key.

use crate::models::{Config, ProviderKind, Result};
use crate::provider::{
    AdapterResolver, AnthropicAdapter, GoogleAdapter, OpenAiAdapter, ProviderAdapter,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of provider adapters keyed by logical model key.
///
/// ```ignore
/// let config = Config::from_file(Path::new("config.toml"))?;
/// let registry = ProviderRegistry::new(config);
/// let adapter = registry.resolve("gpt-4o")?;
/// let status = adapter.poll("batch_abc").await?;
/// ```
pub struct ProviderRegistry {
    config: Config,
    adapters: DashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Build a registry over the configured models. No adapter is created yet.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            adapters: DashMap::new(),
        }
    }

    /// Number of adapters built so far.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    fn build(&self, model_key: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let spec = self.config.model(model_key)?;
        let api_key = spec.resolve_api_key(model_key)?;
        let timeout = self.config.batch.call_timeout_secs;
        let retries = self.config.batch.max_retries;

        let adapter: Arc<dyn ProviderAdapter> = match spec.provider {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => Arc::new(OpenAiAdapter::new(
                model_key, spec, api_key, timeout, retries,
            )?),
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(
                model_key, spec, api_key, timeout, retries,
            )?),
            ProviderKind::Google => Arc::new(GoogleAdapter::new(
                model_key, spec, api_key, timeout, retries,
            )?),
        };

        debug!(model = %model_key, provider = %spec.provider, "Adapter created");
        Ok(adapter)
    }
}

impl AdapterResolver for ProviderRegistry {
    fn resolve(&self, model_key: &str) -> Result<Arc<dyn ProviderAdapter>> {
        if let Some(adapter) = self.adapters.get(model_key) {
            return Ok(Arc::clone(adapter.value()));
        }

        let adapter = self.build(model_key)?;
        self.adapters
            .insert(model_key.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("models", &self.config.models.keys().collect::<Vec<_>>())
            .field("resolved", &self.adapters.len())
            .finish()
    }
}
