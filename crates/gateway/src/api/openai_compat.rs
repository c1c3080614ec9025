//! OpenAI-compatible `/v1/chat/completions` endpoint.
//!
//! Accepts the standard OpenAI `ChatCompletion` request format and forwards
//! it to an OpenAI-type backend from the site config. The answer passes the
//! same sentence-aligned safety filter as chat sessions (without offense
//! accounting) and is returned as an OpenAI-shaped response, streaming or
//! not. Every request is gated by the infer limiter.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use mc_domain::error::{Error, Result};
use mc_domain::frame::{ServerFrame, STAGE_MOSS, STATUS_END, STATUS_PARTIAL, STATUS_SENSITIVE};
use mc_domain::model::{ApiType, ModelConfig, SiteConfig};
use mc_domain::tool::Message;
use mc_domain::trace::TraceEvent;
use mc_providers::{ChatStreamRequest, ChatStreamer};

use crate::runtime::cancel::{CancelObserver, ConnectionGuard};
use crate::runtime::filter::SensitiveFilter;
use crate::runtime::openai_stream::stream_chat;
use crate::runtime::{FrameSender, Outbound};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct OpenAIChatRequest {
    /// Backend model name. Empty picks the site's default OpenAI backend.
    #[serde(default)]
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    pub content: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
struct OpenAIChatResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Serialize)]
struct OpenAIChoice {
    index: u32,
    message: OpenAIResponseMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAIResponseMessage {
    role: &'static str,
    content: String,
}

// ── Streaming chunk types ────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAIChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<OpenAIChunkChoice>,
}

#[derive(Debug, Serialize)]
struct OpenAIChunkChoice {
    index: u32,
    delta: OpenAIChunkDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct OpenAIChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

/// Everything a completion needs once the request has been validated.
struct Completion {
    model: ModelConfig,
    streamer: std::sync::Arc<dyn ChatStreamer>,
    req: ChatStreamRequest,
    id: String,
    created: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chat/completions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<OpenAIChatRequest>,
) -> Response {
    if !state.limiter.allow() {
        tracing::warn!("completion denied by infer limiter");
        return openai_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal server error",
        )
        .into_response();
    }

    let completion = match prepare(&state, &body) {
        Ok(c) => c,
        Err(resp) => return resp.into_response(),
    };

    if body.stream {
        completion_stream(state, completion).into_response()
    } else {
        completion_blocking(state, completion).await.into_response()
    }
}

fn prepare(
    state: &AppState,
    body: &OpenAIChatRequest,
) -> std::result::Result<Completion, (StatusCode, Json<serde_json::Value>)> {
    let Some(model) = pick_model(&state.site.get(), &body.model) else {
        return Err(openai_error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "server_error",
            "No OpenAI-compatible backend is configured.",
        ));
    };
    if !body.messages.iter().any(|m| m.role == "user") {
        return Err(openai_error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "No user message found in messages array",
        ));
    }
    let messages = to_messages(&model, &body.messages).map_err(|role| {
        openai_error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &format!("unsupported message role: {role}"),
        )
    })?;
    let streamer = state.backends.streamer(&model).map_err(|e| {
        tracing::error!(model_id = model.id, error = %e, "no client for backend");
        openai_error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal server error")
    })?;

    let mut overrides: HashMap<String, f64> = HashMap::new();
    if let Some(t) = body.temperature {
        overrides.insert("temperature".into(), t);
    }
    if let Some(p) = body.top_p {
        overrides.insert("top_p".into(), p);
    }
    if let Some(n) = body.max_tokens {
        overrides.insert("max_tokens".into(), f64::from(n));
    }

    let req = ChatStreamRequest {
        messages,
        stop: vec![model.end_delimiter.clone()],
        params: state.config.inference.sampling_with(overrides.iter()),
        model: None,
    };
    Ok(Completion {
        model,
        streamer,
        req,
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        created: chrono::Utc::now().timestamp(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn completion_blocking(state: AppState, c: Completion) -> Response {
    let guard = ConnectionGuard::new();
    let (frames, mut rx) = FrameSender::channel(state.config.inference.frame_buffer);
    // Nobody watches the partial frames; keep the queue moving.
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let mut filter = filter_for(&state, &c.model, frames);
    let outcome = complete(&state, &c, &mut filter, &guard.observer()).await;

    let (content, finish_reason) = match outcome {
        Ok(answer) => (answer, "stop"),
        Err(Error::Sensitive) => (state.config.sensitive.default_refusal.clone(), "content_filter"),
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let kind = if status.is_server_error() { "server_error" } else { "invalid_request_error" };
            return openai_error_response(status, kind, &e.client_message()).into_response();
        }
    };

    Json(OpenAIChatResponse {
        id: c.id,
        object: "chat.completion",
        created: c.created,
        model: c.model.openai_model,
        choices: vec![OpenAIChoice {
            index: 0,
            message: OpenAIResponseMessage {
                role: "assistant",
                content,
            },
            finish_reason,
        }],
    })
    .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn completion_stream(state: AppState, c: Completion) -> impl IntoResponse {
    let guard = ConnectionGuard::new();
    let cancel = guard.observer();
    let (frames, rx) = FrameSender::channel(state.config.inference.frame_buffer);
    let id = c.id.clone();
    let created = c.created;
    let model_name = c.model.openai_model.clone();

    tokio::spawn(async move {
        let mut filter = filter_for(&state, &c.model, frames.clone());
        match complete(&state, &c, &mut filter, &cancel).await {
            Ok(answer) => {
                let _ = frames.frame(ServerFrame::end_with(answer)).await;
            }
            // The refusal frame is already out; an interrupted client is gone.
            Err(Error::Sensitive) | Err(Error::Interrupt) => {}
            Err(e) => {
                let _ = frames.frame(ServerFrame::error(e.status_code(), e.client_message())).await;
            }
        }
    });

    let stream = make_openai_sse_stream(rx, guard, id, created, model_name);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Translate the frame queue into OpenAI chunks. Partial frames carry the
/// whole answer so far; only the new suffix is sent. The guard lives as long
/// as the response stream, so a client hang-up cancels the upstream call.
fn make_openai_sse_stream(
    mut rx: mpsc::Receiver<Outbound>,
    guard: ConnectionGuard,
    completion_id: String,
    created: i64,
    model: String,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        let _guard = guard;
        let chunk = |delta: OpenAIChunkDelta, finish_reason: Option<&'static str>| {
            let chunk = OpenAIChunk {
                id: completion_id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model.clone(),
                choices: vec![OpenAIChunkChoice {
                    index: 0,
                    delta,
                    finish_reason,
                }],
            };
            serde_json::to_string(&chunk).ok().map(|data| Event::default().data(data))
        };

        if let Some(event) = chunk(OpenAIChunkDelta { role: Some("assistant"), content: None }, None) {
            yield Ok(event);
        }

        let mut sent = String::new();
        while let Some(msg) = rx.recv().await {
            let Outbound::Frame(frame) = msg else { continue };
            let output = frame.output.unwrap_or_default();
            match frame.status {
                STATUS_PARTIAL | STATUS_END => {
                    let delta = delta_since(&sent, &output);
                    if !delta.is_empty() {
                        if let Some(event) = chunk(OpenAIChunkDelta { role: None, content: Some(delta) }, None) {
                            yield Ok(event);
                        }
                    }
                    sent = output;
                    if frame.status == STATUS_END {
                        if let Some(event) = chunk(OpenAIChunkDelta { role: None, content: None }, Some("stop")) {
                            yield Ok(event);
                        }
                        break;
                    }
                }
                STATUS_SENSITIVE => {
                    if let Some(event) = chunk(OpenAIChunkDelta { role: None, content: Some(output) }, Some("content_filter")) {
                        yield Ok(event);
                    }
                    break;
                }
                _ => {
                    let err = serde_json::json!({
                        "error": {
                            "message": output,
                            "type": "server_error",
                        }
                    });
                    yield Ok(Event::default().data(err.to_string()));
                    break;
                }
            }
        }

        // Terminate the stream with [DONE].
        yield Ok(Event::default().data("[DONE]"));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the upstream call and feed its outcome to the limiter.
async fn complete(
    state: &AppState,
    c: &Completion,
    filter: &mut SensitiveFilter,
    cancel: &CancelObserver,
) -> Result<String> {
    let started = Instant::now();
    let outcome = stream_chat(c.streamer.as_ref(), &c.req, filter, cancel).await;
    match &outcome {
        Err(Error::Interrupt) | Err(Error::Sensitive) => {}
        other => state.limiter.add_stats(other.is_ok()),
    }
    TraceEvent::UpstreamCall {
        model_id: c.model.id,
        stage: STAGE_MOSS.into(),
        status: outcome.as_ref().map(|_| 200).unwrap_or_else(|e| e.status_code()),
        duration_ms: started.elapsed().as_millis() as u64,
    }
    .emit();
    if let Err(e) = &outcome {
        if e.status_code() >= 500 {
            tracing::error!(model_id = c.model.id, error = %e, "completion failed");
        }
    }
    outcome
}

fn filter_for(state: &AppState, model: &ModelConfig, frames: FrameSender) -> SensitiveFilter {
    SensitiveFilter::new(state.checker.clone(), &state.config.sensitive, frames)
        .check_enabled(model.enable_sensitive_check)
        .end_delimiter(&model.end_delimiter)
}

/// An OpenAI-type backend: the one serving `requested`, else the site
/// default when it is OpenAI-type, else the first OpenAI-type backend.
fn pick_model(site: &SiteConfig, requested: &str) -> Option<ModelConfig> {
    let openai = || site.models.iter().filter(|m| m.api_type == ApiType::Openai);
    if !requested.is_empty() {
        if let Some(m) = openai().find(|m| m.openai_model == requested) {
            return Some(m.clone());
        }
    }
    site.resolve_model(None)
        .filter(|m| m.api_type == ApiType::Openai)
        .or_else(|| openai().next())
        .cloned()
}

/// Convert the request's messages. The backend's system prompt is added
/// when the client sent none. Returns the offending role on failure.
fn to_messages(model: &ModelConfig, messages: &[OpenAIMessage]) -> std::result::Result<Vec<Message>, String> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !model.openai_system_prompt.is_empty() && !messages.iter().any(|m| m.role == "system") {
        out.push(Message::system(model.openai_system_prompt.clone()));
    }
    for m in messages {
        out.push(match m.role.as_str() {
            "system" => Message::system(m.content.clone()),
            "user" => Message::user(m.content.clone()),
            "assistant" => Message::assistant(m.content.clone()),
            other => return Err(other.to_string()),
        });
    }
    Ok(out)
}

fn delta_since(sent: &str, now: &str) -> String {
    now.strip_prefix(sent).unwrap_or(now).to_string()
}

/// Build a standard OpenAI error response.
fn openai_error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "message": message,
                "type": error_type,
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn backend(id: i64, api_type: ApiType, name: &str) -> ModelConfig {
        ModelConfig {
            id,
            url: "http://backend".into(),
            api_type,
            openai_model: name.into(),
            openai_system_prompt: String::new(),
            api_key_env: None,
            end_delimiter: String::new(),
            callback_url: String::new(),
            inner_thoughts_postprocess: true,
            enable_sensitive_check: true,
            default_plugin_config: BTreeMap::new(),
        }
    }

    fn site() -> SiteConfig {
        SiteConfig {
            models: vec![
                backend(1, ApiType::Moss, ""),
                backend(2, ApiType::Openai, "gpt-small"),
                backend(3, ApiType::Openai, "gpt-large"),
            ],
            default_model_id: Some(1),
            ..SiteConfig::default()
        }
    }

    #[test]
    fn named_model_wins() {
        assert_eq!(pick_model(&site(), "gpt-large").map(|m| m.id), Some(3));
    }

    #[test]
    fn moss_default_falls_back_to_first_openai_backend() {
        assert_eq!(pick_model(&site(), "").map(|m| m.id), Some(2));
        assert_eq!(pick_model(&site(), "unknown").map(|m| m.id), Some(2));
    }

    #[test]
    fn no_openai_backend_is_none() {
        let site = SiteConfig {
            models: vec![backend(1, ApiType::Moss, "")],
            ..SiteConfig::default()
        };
        assert!(pick_model(&site, "").is_none());
    }

    #[test]
    fn system_prompt_only_added_when_client_sent_none() {
        let mut model = backend(2, ApiType::Openai, "gpt-small");
        model.openai_system_prompt = "be brief".into();
        let user = OpenAIMessage { role: "user".into(), content: "hi".into() };
        let msgs = to_messages(&model, std::slice::from_ref(&user)).unwrap();
        assert_eq!(msgs[0], Message::system("be brief"));
        assert_eq!(msgs.len(), 2);

        let sys = OpenAIMessage { role: "system".into(), content: "mine".into() };
        let msgs = to_messages(&model, &[sys, user]).unwrap();
        assert_eq!(msgs[0], Message::system("mine"));
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let model = backend(2, ApiType::Openai, "gpt-small");
        let msg = OpenAIMessage { role: "tool".into(), content: "{}".into() };
        assert_eq!(to_messages(&model, &[msg]).unwrap_err(), "tool");
    }

    #[test]
    fn deltas_are_new_suffixes() {
        assert_eq!(delta_since("Hello.", "Hello. World"), " World");
        assert_eq!(delta_since("", "Hi."), "Hi.");
        assert_eq!(delta_since("abc", "xyz"), "xyz");
    }
}
