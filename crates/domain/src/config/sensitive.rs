use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content safety
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveConfig {
    /// Characters that close a segment eligible for checking.
    #[serde(default = "d_terminators")]
    pub terminators: String,
    /// Response stored and shown when content is flagged.
    #[serde(default = "d_refusal")]
    pub default_refusal: String,
    /// Shown instead of the refusal once the user is banned.
    #[serde(default = "d_ban_notice")]
    pub ban_notice: String,
    #[serde(default)]
    pub checker: CheckerConfig,
}

impl Default for SensitiveConfig {
    fn default() -> Self {
        Self {
            terminators: d_terminators(),
            default_refusal: d_refusal(),
            ban_notice: d_ban_notice(),
            checker: CheckerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckerKind {
    #[default]
    None,
    Keywords,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckerConfig {
    #[serde(default)]
    pub kind: CheckerKind,
    /// Endpoint for `kind = "http"`: POST `{text}` → `{sensitive}`.
    #[serde(default)]
    pub url: Option<String>,
    /// Case-insensitive substrings for `kind = "keywords"`.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn d_terminators() -> String {
    ",.?!\n，。？！".into()
}
fn d_refusal() -> String {
    "Sorry, I cannot answer this question. Let's talk about something else.".into()
}
fn d_ban_notice() -> String {
    "Your account has been suspended because of repeated policy violations.".into()
}
