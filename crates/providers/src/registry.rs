//! Provider registry.
//!
//! Builds and caches one client per model config. Model configs are read
//! through the site config cache and may change at runtime, so a cached
//! client is rebuilt whenever its URL or API type no longer matches.

use std::collections::HashMap;
use std::sync::Arc;

use mc_domain::error::{Error, Result};
use mc_domain::model::{ApiType, ModelConfig};
use parking_lot::RwLock;

use crate::moss::MossClient;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::{BackendResolver, ChatStreamer, MossBackend};

#[derive(Clone)]
enum Client {
    Moss(Arc<dyn MossBackend>),
    OpenAi(Arc<dyn ChatStreamer>),
}

struct Entry {
    url: String,
    api_type: ApiType,
    client: Client,
}

pub struct ProviderRegistry {
    timeout_secs: u64,
    clients: RwLock<HashMap<i64, Entry>>,
}

impl ProviderRegistry {
    /// `timeout_secs` bounds each upstream request.
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn resolve(&self, model: &ModelConfig) -> Result<Client> {
        if let Some(entry) = self.clients.read().get(&model.id) {
            if entry.url == model.url && entry.api_type == model.api_type {
                return Ok(entry.client.clone());
            }
        }

        let client = match model.api_type {
            ApiType::Moss => Client::Moss(Arc::new(MossClient::from_config(model, self.timeout_secs)?)),
            ApiType::Openai => Client::OpenAi(Arc::new(OpenAiCompatProvider::from_config(
                model,
                self.timeout_secs,
            )?)),
        };
        tracing::info!(model_id = model.id, api_type = ?model.api_type, url = %model.url, "registered inference backend");
        self.clients.write().insert(
            model.id,
            Entry {
                url: model.url.clone(),
                api_type: model.api_type,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}

impl BackendResolver for ProviderRegistry {
    fn moss(&self, model: &ModelConfig) -> Result<Arc<dyn MossBackend>> {
        match self.resolve(model)? {
            Client::Moss(c) => Ok(c),
            Client::OpenAi(_) => Err(Error::Config(format!("model {} is not a MOSS backend", model.id))),
        }
    }

    fn streamer(&self, model: &ModelConfig) -> Result<Arc<dyn ChatStreamer>> {
        match self.resolve(model)? {
            Client::OpenAi(c) => Ok(c),
            Client::Moss(_) => Err(Error::Config(format!(
                "model {} is not an OpenAI-compatible backend",
                model.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn model(id: i64, api_type: ApiType, url: &str) -> ModelConfig {
        ModelConfig {
            id,
            url: url.into(),
            api_type,
            openai_model: "m".into(),
            openai_system_prompt: String::new(),
            api_key_env: None,
            end_delimiter: String::new(),
            callback_url: String::new(),
            inner_thoughts_postprocess: true,
            enable_sensitive_check: true,
            default_plugin_config: BTreeMap::new(),
        }
    }

    #[test]
    fn clients_are_cached_until_url_changes() {
        let registry = ProviderRegistry::new(5);
        let a = registry.moss(&model(1, ApiType::Moss, "http://a")).unwrap();
        let b = registry.moss(&model(1, ApiType::Moss, "http://a")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.moss(&model(1, ApiType::Moss, "http://b")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn api_type_mismatch_is_a_config_error() {
        let registry = ProviderRegistry::new(5);
        assert!(registry.streamer(&model(2, ApiType::Moss, "http://a")).is_err());
        assert!(registry.moss(&model(3, ApiType::Openai, "http://a")).is_err());
    }
}
