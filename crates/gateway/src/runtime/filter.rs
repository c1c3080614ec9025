//! Sentence-aligned safety filter for streamed output.
//!
//! Streamed text is only released to the client up to its last sentence
//! terminator, and only after that whole prefix passed the checker. The
//! released prefix never shrinks. A flagged prefix ends the turn with one
//! `-2` frame carrying the refusal (or the ban notice when the offense
//! banned the user).

use std::sync::Arc;

use mc_domain::config::SensitiveConfig;
use mc_domain::error::{Error, Result};
use mc_domain::frame::ServerFrame;
use mc_domain::model::OffenseType;
use mc_domain::trace::TraceEvent;
use mc_providers::SensitiveChecker;
use mc_sessions::OffenseAccounting;

use super::FrameSender;

/// Who a flagged response is charged to.
pub struct HitAccounting {
    pub offense: Arc<OffenseAccounting>,
    pub user_id: i64,
    pub chat_id: i64,
}

pub struct SensitiveFilter {
    checker: Arc<dyn SensitiveChecker>,
    check_enabled: bool,
    terminators: Vec<char>,
    end_delimiter: String,
    refusal: String,
    ban_notice: String,
    frames: FrameSender,
    accounting: Option<HitAccounting>,
    detected: String,
    flagged: Option<String>,
    terminated: bool,
}

impl SensitiveFilter {
    pub fn new(checker: Arc<dyn SensitiveChecker>, cfg: &SensitiveConfig, frames: FrameSender) -> Self {
        Self {
            checker,
            check_enabled: true,
            terminators: cfg.terminators.chars().collect(),
            end_delimiter: String::new(),
            refusal: cfg.default_refusal.clone(),
            ban_notice: cfg.ban_notice.clone(),
            frames,
            accounting: None,
            detected: String::new(),
            flagged: None,
            terminated: false,
        }
    }

    /// Skip the checker entirely (user or model opted out).
    pub fn check_enabled(mut self, enabled: bool) -> Self {
        self.check_enabled = enabled;
        self
    }

    /// Output is cut at the first occurrence. Empty disables.
    pub fn end_delimiter(mut self, delimiter: &str) -> Self {
        self.end_delimiter = delimiter.to_string();
        self
    }

    pub fn with_accounting(mut self, accounting: HitAccounting) -> Self {
        self.accounting = Some(accounting);
        self
    }

    /// The text that tripped the checker, if any.
    pub fn flagged(&self) -> Option<&str> {
        self.flagged.as_deref()
    }

    /// True once the end delimiter was seen; no further input is expected.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Cut `text` at the end delimiter. Returns whether it was present.
    pub fn truncate<'a>(&self, text: &'a str) -> (&'a str, bool) {
        if self.end_delimiter.is_empty() {
            return (text, false);
        }
        match text.split_once(self.end_delimiter.as_str()) {
            Some((head, _)) => (head, true),
            None => (text, false),
        }
    }

    /// Offer the accumulated output so far.
    pub async fn feed(&mut self, now_output: &str) -> Result<()> {
        let (now, hit_delimiter) = self.truncate(now_output);
        if hit_delimiter {
            self.terminated = true;
        }
        let Some((idx, c)) = now.char_indices().rev().find(|(_, c)| self.terminators.contains(c)) else {
            return Ok(());
        };
        let before = &now[..idx + c.len_utf8()];
        if before.len() <= self.detected.len() {
            return Ok(());
        }
        self.release(before).await
    }

    /// Offer the final output; the residual tail after the last terminator
    /// is checked and released here.
    pub async fn finish(&mut self, final_output: &str) -> Result<()> {
        let (text, _) = self.truncate(final_output);
        if text.is_empty() || text == self.detected {
            return Ok(());
        }
        self.release(text).await
    }

    async fn release(&mut self, text: &str) -> Result<()> {
        if self.check_enabled && self.is_sensitive(text).await {
            return self.reject(text).await;
        }
        self.detected = text.to_string();
        self.frames.frame(ServerFrame::partial(text)).await
    }

    async fn is_sensitive(&self, text: &str) -> bool {
        match self.checker.is_sensitive(text).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(checker = self.checker.name(), error = %e, "sensitive check failed, passing text");
                false
            }
        }
    }

    async fn reject(&mut self, text: &str) -> Result<()> {
        self.flagged = Some(text.to_string());
        let banned = match &self.accounting {
            Some(acc) => {
                TraceEvent::SensitiveHit {
                    user_id: acc.user_id,
                    chat_id: acc.chat_id,
                    side: "response".into(),
                }
                .emit();
                acc.offense
                    .add_offense(acc.user_id, OffenseType::ResponseOffense)
                    .unwrap_or_else(|e| {
                        tracing::error!(user_id = acc.user_id, error = %e, "failed to record offense");
                        false
                    })
            }
            None => false,
        };
        let message = if banned { &self.ban_notice } else { &self.refusal };
        self.frames.frame(ServerFrame::sensitive(message.clone())).await?;
        Err(Error::Sensitive)
    }
}
