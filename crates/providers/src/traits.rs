use std::collections::BTreeMap;
use std::sync::Arc;

use mc_domain::error::Result;
use mc_domain::model::ModelConfig;
use mc_domain::stream::{BoxStream, StreamEvent};
use mc_domain::tool::Message;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MOSS stage request / response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Body of one MOSS stage POST.
///
/// Plugin toggles and sampling parameters are flattened into the top-level
/// object next to the prompt.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MossRequest {
    pub x: String,
    /// Callback URL with the stage's correlation uuid appended.
    pub url: String,
    pub session_id: i64,
    #[serde(flatten)]
    pub plugins: BTreeMap<String, bool>,
    #[serde(flatten)]
    pub params: BTreeMap<String, f64>,
}

/// Final payload of a MOSS stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MossResponse {
    #[serde(default)]
    pub pred: String,
    pub new_generations: String,
    #[serde(default)]
    pub input_token_num: u64,
    #[serde(default)]
    pub new_generations_token_num: u64,
}

/// One MOSS inference backend.
#[async_trait::async_trait]
pub trait MossBackend: Send + Sync {
    /// POST one stage and wait for its final generation. Incremental output
    /// arrives separately on the callback channel named in `req.url`.
    async fn infer(&self, req: &MossRequest) -> Result<MossResponse>;

    fn model_id(&self) -> i64;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OpenAI-style streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct ChatStreamRequest {
    pub messages: Vec<Message>,
    /// Empty entries are dropped before sending.
    pub stop: Vec<String>,
    /// Sampling parameters; only keys the OpenAI contract knows are sent.
    pub params: BTreeMap<String, f64>,
    /// Model name override. `None` uses the backend's configured model.
    pub model: Option<String>,
}

/// An OpenAI-compatible chat completion backend.
#[async_trait::async_trait]
pub trait ChatStreamer: Send + Sync {
    async fn chat_stream(
        &self,
        req: &ChatStreamRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    fn provider_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hands out clients for a model config. Model configs come from the site
/// config cache, so clients are resolved per session rather than at startup.
pub trait BackendResolver: Send + Sync {
    fn moss(&self, model: &ModelConfig) -> Result<Arc<dyn MossBackend>>;
    fn streamer(&self, model: &ModelConfig) -> Result<Arc<dyn ChatStreamer>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moss_request_flattens_plugins_and_params() {
        let req = MossRequest {
            x: "<|Human|>: hi<eoh>\n<|Inner Thoughts|>:".into(),
            url: "ws://gw/v1/callback/ws?uuid=abc".into(),
            session_id: 42,
            plugins: [("search".to_string(), true)].into(),
            params: [("temperature".to_string(), 0.7)].into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["session_id"], 42);
        assert_eq!(v["search"], true);
        assert_eq!(v["temperature"], 0.7);
        assert!(v.get("plugins").is_none());
    }
}
