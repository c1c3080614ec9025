use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inference backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire protocol spoken by an inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    /// Two-stage MOSS protocol with callback streaming.
    #[default]
    Moss,
    /// Single-stage OpenAI-compatible chat completions with SSE streaming.
    Openai,
}

/// Identifies one inference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub api_type: ApiType,
    #[serde(default)]
    pub openai_model: String,
    #[serde(default)]
    pub openai_system_prompt: String,
    /// Environment variable holding the OpenAI-style API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Generation is cut at the first occurrence of this string. Empty disables.
    #[serde(default)]
    pub end_delimiter: String,
    /// Base URL the MOSS backend calls back on; `?uuid=` is appended per stage.
    #[serde(default)]
    pub callback_url: String,
    /// Rewrite Inner Thoughts to `None` when the command list is unparseable.
    #[serde(default = "d_true")]
    pub inner_thoughts_postprocess: bool,
    #[serde(default = "d_true")]
    pub enable_sensitive_check: bool,
    /// plugin name → enabled by default.
    #[serde(default)]
    pub default_plugin_config: BTreeMap<String, bool>,
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Site-wide tuning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-global tuning persisted alongside the chat data.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default)]
    pub invite_required: bool,
    #[serde(default)]
    pub notice: String,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub default_model_id: Option<i64>,
}

impl SiteConfig {
    /// Look up a model by id, falling back to the default model and then to
    /// the first configured one.
    pub fn resolve_model(&self, model_id: Option<i64>) -> Option<&ModelConfig> {
        model_id
            .and_then(|id| self.models.iter().find(|m| m.id == id))
            .or_else(|| {
                self.default_model_id
                    .and_then(|id| self.models.iter().find(|m| m.id == id))
            })
            .or_else(|| self.models.first())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub model_id: Option<i64>,
    /// plugin name → enabled for this user.
    #[serde(default)]
    pub plugin_config: BTreeMap<String, bool>,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub disable_sensitive_check: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            model_id: None,
            plugin_config: BTreeMap::new(),
            banned: false,
            disable_sensitive_check: false,
            created_at: Utc::now(),
        }
    }

    /// Reconcile the user's plugin map with a model's defaults: keys the
    /// model introduced are added disabled, keys it dropped are removed.
    /// Returns true when the map changed.
    pub fn sync_plugin_config(&mut self, defaults: &BTreeMap<String, bool>) -> bool {
        let before = self.plugin_config.len();
        self.plugin_config.retain(|k, _| defaults.contains_key(k));
        let mut changed = self.plugin_config.len() != before;
        for key in defaults.keys() {
            if !self.plugin_config.contains_key(key) {
                self.plugin_config.insert(key.clone(), false);
                changed = true;
            }
        }
        changed
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offenses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OffenseType {
    PromptOffense,
    ResponseOffense,
}

impl OffenseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffenseType::PromptOffense => "prompt",
            OffenseType::ResponseOffense => "response",
        }
    }
}

/// One row of the append-only offense log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserOffense {
    pub user_id: i64,
    pub kind: OffenseType,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chats and records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub name: String,
    /// Number of non-deleted records.
    #[serde(default)]
    pub count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One request/response turn inside a chat.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Record {
    pub id: i64,
    pub chat_id: i64,
    pub request: String,
    pub response: String,
    /// The Inner Thoughts, Commands, Results and MOSS sections of this turn.
    #[serde(default)]
    pub raw_content: String,
    /// Rolling dialogue text fed verbatim into the next turn's prompt.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub inner_thoughts: String,
    #[serde(default)]
    pub extra_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub processed_extra_data: Vec<serde_json::Value>,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub request_sensitive: bool,
    #[serde(default)]
    pub response_sensitive: bool,
    #[serde(default)]
    pub feedback: String,
    /// -1, 0 or 1.
    #[serde(default)]
    pub like: i8,
    #[serde(default)]
    pub model_id: i64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(chat_id: i64, request: impl Into<String>, model_id: i64) -> Self {
        Self {
            chat_id,
            request: request.into(),
            model_id,
            created_at: Utc::now(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugins(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn plugin_sync_adds_disabled_and_drops_obsolete() {
        let mut user = User::new(1);
        user.plugin_config = plugins(&[("search", true), ("legacy", true)]);

        let changed = user.sync_plugin_config(&plugins(&[("search", true), ("calculator", true)]));

        assert!(changed);
        assert_eq!(
            user.plugin_config,
            plugins(&[("search", true), ("calculator", false)])
        );
    }

    #[test]
    fn plugin_sync_is_noop_when_keys_match() {
        let mut user = User::new(1);
        user.plugin_config = plugins(&[("search", false)]);
        assert!(!user.sync_plugin_config(&plugins(&[("search", true)])));
        assert_eq!(user.plugin_config, plugins(&[("search", false)]));
    }

    #[test]
    fn resolve_model_falls_back_to_default_then_first() {
        let model = |id| ModelConfig {
            id,
            url: format!("http://m{id}"),
            api_type: ApiType::Moss,
            openai_model: String::new(),
            openai_system_prompt: String::new(),
            api_key_env: None,
            end_delimiter: String::new(),
            callback_url: String::new(),
            inner_thoughts_postprocess: true,
            enable_sensitive_check: true,
            default_plugin_config: BTreeMap::new(),
        };
        let mut site = SiteConfig {
            models: vec![model(1), model(2)],
            default_model_id: Some(2),
            ..Default::default()
        };
        assert_eq!(site.resolve_model(Some(1)).map(|m| m.id), Some(1));
        assert_eq!(site.resolve_model(Some(9)).map(|m| m.id), Some(2));
        site.default_model_id = None;
        assert_eq!(site.resolve_model(None).map(|m| m.id), Some(1));
    }

    #[test]
    fn api_type_deserializes_lowercase() {
        let t: ApiType = serde_json::from_str(r#""openai""#).unwrap();
        assert_eq!(t, ApiType::Openai);
    }
}
