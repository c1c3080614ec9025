use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Stage label of the user-visible answer.
pub const STAGE_MOSS: &str = "MOSS";
/// Stage label of the hidden reasoning generation.
pub const STAGE_INNER_THOUGHTS: &str = "Inner Thoughts";

pub const STATUS_PARTIAL: i32 = 1;
pub const STATUS_END: i32 = 0;
pub const STATUS_ERROR: i32 = -1;
pub const STATUS_SENSITIVE: i32 = -2;
/// Only sent by backends on the callback channel.
pub const STATUS_HEARTBEAT: i32 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server → client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frame streamed to a client on an inference channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ServerFrame {
    pub fn partial(output: impl Into<String>) -> Self {
        Self {
            status: STATUS_PARTIAL,
            status_code: None,
            output: Some(output.into()),
            stage: Some(STAGE_MOSS.into()),
        }
    }

    /// End of a MOSS turn. Carries no output.
    pub fn end() -> Self {
        Self {
            status: STATUS_END,
            status_code: None,
            output: None,
            stage: None,
        }
    }

    /// End of an OpenAI-style turn, carrying the final text.
    pub fn end_with(output: impl Into<String>) -> Self {
        Self {
            status: STATUS_END,
            status_code: None,
            output: Some(output.into()),
            stage: Some(STAGE_MOSS.into()),
        }
    }

    pub fn error(status_code: u16, output: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            status_code: Some(status_code),
            output: Some(output.into()),
            stage: None,
        }
    }

    pub fn sensitive(output: impl Into<String>) -> Self {
        Self {
            status: STATUS_SENSITIVE,
            status_code: None,
            output: Some(output.into()),
            stage: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend → server (callback channel)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Incremental frame pushed by a MOSS backend over the callback socket.
/// `output` is the accumulated generation so far, not a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackFrame {
    pub status: i32,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub stage: String,
}

impl CallbackFrame {
    pub fn new(status: i32, output: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
            stage: stage.into(),
        }
    }

    /// Normalize streamed text before it is queued: trailing replacement
    /// characters from split multi-byte tokens, surrounding spaces and a
    /// dangling `<eom>` prefix are removed.
    pub fn post_process(mut self) -> Self {
        let mut text = self.output.trim_end_matches('\u{FFFD}').trim();
        for partial in ["<eom>", "<eom", "<eo", "<e", "<"] {
            if let Some(stripped) = text.strip_suffix(partial) {
                text = stripped.trim_end();
                break;
            }
        }
        self.output = text.to_string();
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// First frame of a new-record session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequestFrame {
    pub request: String,
    #[serde(default)]
    pub param: HashMap<String, f64>,
}

/// Any later client frame. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientControlFrame {
    #[serde(default)]
    pub interrupt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_frame_serializes_status_only() {
        let json = serde_json::to_string(&ServerFrame::end()).unwrap();
        assert_eq!(json, r#"{"status":0}"#);
    }

    #[test]
    fn partial_frame_carries_stage() {
        let v = serde_json::to_value(ServerFrame::partial("Hi there!")).unwrap();
        assert_eq!(v["status"], 1);
        assert_eq!(v["output"], "Hi there!");
        assert_eq!(v["stage"], "MOSS");
    }

    #[test]
    fn post_process_strips_replacement_chars_and_partial_markers() {
        let f = CallbackFrame::new(1, " Hello\u{FFFD}\u{FFFD}", STAGE_MOSS).post_process();
        assert_eq!(f.output, "Hello");

        for tail in ["<", "<e", "<eo", "<eom", "<eom>"] {
            let f = CallbackFrame::new(1, format!("Hi there!{tail}"), STAGE_MOSS).post_process();
            assert_eq!(f.output, "Hi there!", "tail {tail:?}");
        }
    }

    #[test]
    fn post_process_keeps_other_markup() {
        let f = CallbackFrame::new(1, "a <b> c", STAGE_MOSS).post_process();
        assert_eq!(f.output, "a <b> c");
    }

    #[test]
    fn control_frame_ignores_unknown_fields() {
        let f: ClientControlFrame = serde_json::from_str(r#"{"interrupt":true,"x":1}"#).unwrap();
        assert!(f.interrupt);
        let f: ClientControlFrame = serde_json::from_str("{}").unwrap();
        assert!(!f.interrupt);
    }
}
