use serde::Serialize;

/// Structured trace events emitted across all mosschat crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    UpstreamCall {
        model_id: i64,
        stage: String,
        status: u16,
        duration_ms: u64,
    },
    FormatRepaired {
        section: String,
        found: String,
        expected: String,
    },
    CallbackDropped {
        uuid: String,
        reason: String,
    },
    ToolFailed {
        action: String,
        error: String,
    },
    SensitiveHit {
        user_id: i64,
        chat_id: i64,
        side: String,
    },
    UserBanned {
        user_id: i64,
        offense: String,
        count: usize,
    },
    TurnFinished {
        chat_id: i64,
        record_id: i64,
        duration_secs: f64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "mc_event");
    }
}
