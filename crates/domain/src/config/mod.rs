mod inference;
mod limits;
mod observability;
mod sensitive;
mod server;
mod site;
mod tools;

pub use inference::*;
pub use limits::*;
pub use observability::*;
pub use sensitive::*;
pub use server::*;
pub use site::*;
pub use tools::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::model::{ApiType, ModelConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    /// Inference backends. When non-empty they replace the persisted site
    /// config's model list at startup.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub default_model_id: Option<i64>,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub sensitive: SensitiveConfig,
    #[serde(default)]
    pub offense: OffenseConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut push = |severity, field: String, message: &str| {
            errors.push(ConfigError {
                severity,
                field,
                message: message.into(),
            })
        };

        if self.server.port == 0 {
            push(ConfigSeverity::Error, "server.port".into(), "port must be greater than 0");
        }
        if self.server.host.is_empty() {
            push(ConfigSeverity::Error, "server.host".into(), "host must not be empty");
        }
        if self.server.cors.allowed_origins.len() == 1 && self.server.cors.allowed_origins[0] == "*" {
            push(
                ConfigSeverity::Warning,
                "server.cors.allowed_origins".into(),
                "wildcard \"*\" allows all origins (not recommended for production)",
            );
        }

        if self.models.is_empty() {
            push(ConfigSeverity::Warning, "models".into(), "no inference backends configured");
        }
        let mut seen = HashSet::new();
        for (i, model) in self.models.iter().enumerate() {
            if !seen.insert(model.id) {
                push(ConfigSeverity::Error, format!("models[{i}].id"), "duplicate model id");
            }
            if model.url.is_empty() {
                push(ConfigSeverity::Error, format!("models[{i}].url"), "url must not be empty");
            }
            match model.api_type {
                ApiType::Moss if model.callback_url.is_empty() => push(
                    ConfigSeverity::Error,
                    format!("models[{i}].callback_url"),
                    "MOSS backends need a callback_url",
                ),
                ApiType::Openai if model.openai_model.is_empty() => push(
                    ConfigSeverity::Error,
                    format!("models[{i}].openai_model"),
                    "OpenAI backends need a model name",
                ),
                _ => {}
            }
        }
        if let Some(id) = self.default_model_id {
            if !self.models.iter().any(|m| m.id == id) {
                push(
                    ConfigSeverity::Error,
                    "default_model_id".into(),
                    "default_model_id does not name a configured model",
                );
            }
        }

        if self.inference.callback_idle_timeout_secs == 0 {
            push(
                ConfigSeverity::Error,
                "inference.callback_idle_timeout_secs".into(),
                "timeout must be greater than 0",
            );
        }
        if self.inference.frame_buffer == 0 {
            push(ConfigSeverity::Error, "inference.frame_buffer".into(), "buffer must be greater than 0");
        }

        if self.sensitive.terminators.is_empty() {
            push(
                ConfigSeverity::Error,
                "sensitive.terminators".into(),
                "at least one segment terminator is required",
            );
        }
        match self.sensitive.checker.kind {
            CheckerKind::Http if self.sensitive.checker.url.is_none() => push(
                ConfigSeverity::Error,
                "sensitive.checker.url".into(),
                "http checker needs a url",
            ),
            CheckerKind::Keywords if self.sensitive.checker.keywords.is_empty() => push(
                ConfigSeverity::Warning,
                "sensitive.checker.keywords".into(),
                "keyword checker has no keywords and will never flag",
            ),
            _ => {}
        }

        if self.limiter.rate_per_second == 0 || self.limiter.burst == 0 {
            push(ConfigSeverity::Error, "limiter".into(), "rate and burst must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.limiter.max_failure_ratio) {
            push(
                ConfigSeverity::Error,
                "limiter.max_failure_ratio".into(),
                "ratio must be within 0.0..=1.0",
            );
        }
        if self.site.cache_jitter_secs >= self.site.cache_ttl_secs {
            push(
                ConfigSeverity::Warning,
                "site.cache_jitter_secs".into(),
                "jitter is not smaller than the TTL",
            );
        }

        errors
    }
}
