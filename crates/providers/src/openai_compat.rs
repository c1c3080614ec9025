//! OpenAI-compatible streaming adapter.
//!
//! Works with vLLM, Ollama, LM Studio and any other endpoint that follows the
//! OpenAI chat completions contract.

use crate::traits::{ChatStreamRequest, ChatStreamer};
use crate::util::{client_with_timeout, from_reqwest, resolve_api_key};
use mc_domain::error::{Error, Result};
use mc_domain::model::ModelConfig;
use mc_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::Value;

/// Sampling keys forwarded to the upstream body.
const OPENAI_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "presence_penalty",
    "frequency_penalty",
];

pub struct OpenAiCompatProvider {
    id: String,
    url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(model: &ModelConfig, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            id: format!("openai:{}", model.id),
            url: chat_completions_url(&model.url),
            api_key: resolve_api_key(model.api_key_env.as_deref())?,
            default_model: model.openai_model.clone(),
            client: client_with_timeout(timeout_secs)?,
        })
    }

    fn build_body(&self, req: &ChatStreamRequest) -> Value {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "messages": req.messages,
            "stream": true,
        });
        let stop: Vec<&str> = req
            .stop
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        if !stop.is_empty() {
            body["stop"] = serde_json::json!(stop);
        }
        for key in OPENAI_PARAMS {
            if let Some(v) = req.params.get(*key) {
                body[*key] = if *key == "max_tokens" {
                    serde_json::json!(*v as u64)
                } else {
                    serde_json::json!(v)
                };
            }
        }
        body
    }
}

/// Accept either a base URL (`http://host/v1`) or the full endpoint.
fn chat_completions_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.ends_with("/chat/completions") {
        url.to_string()
    } else {
        format!("{url}/chat/completions")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

/// Parse one `data:` payload, handling the `[DONE]` sentinel.
pub(crate) fn parse_sse_data(data: &str) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("upstream stream error")
            .to_string();
        return vec![Ok(StreamEvent::Error { message })];
    }

    let Some(choice) = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    // A final chunk may carry both the last token and the finish reason.
    if let Some(text) = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token { text: text.to_string() }));
        }
    }
    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        events.push(Ok(StreamEvent::Done {
            usage: v.get("usage").and_then(parse_usage),
            finish_reason: Some(fr.to_string()),
        }));
    }
    events
}

/// A 400 from the upstream means the prompt did not fit, as on the MOSS path.
fn classify_status(provider: &str, status: u16, body: &str) -> Error {
    match status {
        400 => Error::MaxInputExceeded,
        other => Error::Internal(format!("{provider}: upstream HTTP {other}: {}", body.trim())),
    }
}

#[async_trait::async_trait]
impl ChatStreamer for OpenAiCompatProvider {
    async fn chat_stream(
        &self,
        req: &ChatStreamRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req);
        tracing::debug!(provider = %self.id, url = %self.url, "openai_compat stream request");

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder.send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            tracing::warn!(provider = %self.id, status = status.as_u16(), body = %err_text.trim(), "openai_compat upstream rejected request");
            return Err(classify_status(&self.id, status.as_u16(), &err_text));
        }

        Ok(crate::sse::sse_response_stream(resp, parse_sse_data))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_domain::tool::Message;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider {
            id: "openai:1".into(),
            url: chat_completions_url("http://vllm:8000/v1/"),
            api_key: None,
            default_model: "moss-moon".into(),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn url_gets_endpoint_suffix_once() {
        assert_eq!(chat_completions_url("http://h/v1/"), "http://h/v1/chat/completions");
        assert_eq!(
            chat_completions_url("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn body_drops_empty_stop_and_unknown_params() {
        let req = ChatStreamRequest {
            messages: vec![Message::system("sys"), Message::user("hi")],
            stop: vec![String::new()],
            params: [
                ("temperature".to_string(), 0.5),
                ("max_tokens".to_string(), 256.0),
                ("repetition_penalty".to_string(), 1.1),
            ]
            .into(),
            model: None,
        };
        let body = provider().build_body(&req);
        assert_eq!(body["model"], "moss-moon");
        assert_eq!(body["stream"], true);
        assert!(body.get("stop").is_none());
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("repetition_penalty").is_none());
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn parse_token_and_finish_in_same_chunk() {
        let events = parse_sse_data(
            r#"{"choices":[{"delta":{"content":"end."},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Token { text }) if text == "end."));
        assert!(matches!(&events[1], Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn parse_role_only_chunk_yields_nothing() {
        let events = parse_sse_data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn parse_in_band_error() {
        let events = parse_sse_data(r#"{"error":{"message":"overloaded"}}"#);
        assert!(matches!(&events[0], Ok(StreamEvent::Error { message }) if message == "overloaded"));
    }
}
