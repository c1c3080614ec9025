use serde::{Deserialize, Serialize};

/// A chat message on the OpenAI-style path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into() }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into() }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into() }
    }
}

/// Structured side payload produced by one tool invocation, stored on the
/// record next to the textual result fed back into the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(rename = "type")]
    pub kind: String,
    pub request: String,
    pub data: serde_json::Value,
}

impl ExtraData {
    pub fn new(kind: impl Into<String>, request: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            request: request.into(),
            data,
        }
    }
}
