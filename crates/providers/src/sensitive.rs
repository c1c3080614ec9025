//! Content-safety checkers consulted on requests and on streamed segments.

use std::sync::Arc;

use mc_domain::config::{CheckerKind, SensitiveConfig};
use mc_domain::error::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::util::{client_with_timeout, from_reqwest};

#[async_trait::async_trait]
pub trait SensitiveChecker: Send + Sync {
    /// Whether `text` must not be shown.
    async fn is_sensitive(&self, text: &str) -> Result<bool>;

    fn name(&self) -> &'static str;
}

/// Build the checker selected in configuration.
pub fn from_config(cfg: &SensitiveConfig) -> Result<Arc<dyn SensitiveChecker>> {
    let checker: Arc<dyn SensitiveChecker> = match cfg.checker.kind {
        CheckerKind::None => Arc::new(NoopChecker),
        CheckerKind::Keywords => Arc::new(KeywordChecker::new(&cfg.checker.keywords)),
        CheckerKind::Http => {
            let url = cfg
                .checker
                .url
                .clone()
                .ok_or_else(|| Error::Config("sensitive.checker.url is required for kind = \"http\"".into()))?;
            Arc::new(HttpChecker::new(url, cfg.checker.timeout_secs.unwrap_or(5))?)
        }
    };
    tracing::info!(checker = checker.name(), "sensitive checker configured");
    Ok(checker)
}

// ── None ────────────────────────────────────────────────────────────

pub struct NoopChecker;

#[async_trait::async_trait]
impl SensitiveChecker for NoopChecker {
    async fn is_sensitive(&self, _text: &str) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

// ── Keywords ────────────────────────────────────────────────────────

/// Case-insensitive substring match against a fixed list.
pub struct KeywordChecker {
    keywords: Vec<String>,
}

impl KeywordChecker {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl SensitiveChecker for KeywordChecker {
    async fn is_sensitive(&self, text: &str) -> Result<bool> {
        let lowered = text.to_lowercase();
        Ok(self.keywords.iter().any(|k| lowered.contains(k.as_str())))
    }

    fn name(&self) -> &'static str {
        "keywords"
    }
}

// ── HTTP ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CheckRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct CheckResponse {
    sensitive: bool,
}

/// Delegates to an external moderation service: POST `{text}` → `{sensitive}`.
pub struct HttpChecker {
    url: String,
    client: reqwest::Client,
}

impl HttpChecker {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            url,
            client: client_with_timeout(timeout_secs)?,
        })
    }
}

#[async_trait::async_trait]
impl SensitiveChecker for HttpChecker {
    async fn is_sensitive(&self, text: &str) -> Result<bool> {
        let resp = self
            .client
            .post(&self.url)
            .json(&CheckRequest { text })
            .send()
            .await
            .map_err(from_reqwest)?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("checker returned HTTP {}", resp.status().as_u16())));
        }
        let body: CheckResponse = resp.json().await.map_err(from_reqwest)?;
        Ok(body.sensitive)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyword_match_is_case_insensitive() {
        let checker = KeywordChecker::new(&["Offensive".into(), "  ".into()]);
        assert!(checker.is_sensitive("some OFFENSIVE sentence.").await.unwrap());
        assert!(!checker.is_sensitive("a friendly sentence.").await.unwrap());
    }

    #[tokio::test]
    async fn noop_never_flags() {
        assert!(!NoopChecker.is_sensitive("anything").await.unwrap());
    }

    #[test]
    fn http_kind_without_url_is_rejected() {
        let mut cfg = SensitiveConfig::default();
        cfg.checker.kind = CheckerKind::Http;
        assert!(from_config(&cfg).is_err());
    }
}
