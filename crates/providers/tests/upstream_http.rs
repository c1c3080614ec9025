//! HTTP-level tests of the upstream clients against a mock server.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use mc_domain::config::{CheckerKind, SensitiveConfig};
use mc_domain::error::Error;
use mc_domain::model::{ApiType, ModelConfig};
use mc_domain::stream::StreamEvent;
use mc_domain::tool::Message;
use mc_providers::{BackendResolver, ChatStreamRequest, MossRequest, ProviderRegistry};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn model(api_type: ApiType, url: String) -> ModelConfig {
    ModelConfig {
        id: 1,
        url,
        api_type,
        openai_model: "moss-moon".into(),
        openai_system_prompt: String::new(),
        api_key_env: None,
        end_delimiter: String::new(),
        callback_url: "ws://gw/v1/callback/ws".into(),
        inner_thoughts_postprocess: true,
        enable_sensitive_check: true,
        default_plugin_config: BTreeMap::new(),
    }
}

fn stage_request() -> MossRequest {
    MossRequest {
        x: "<|Human|>: hello<eoh>\n<|Inner Thoughts|>:".into(),
        url: "ws://gw/v1/callback/ws?uuid=u1".into(),
        session_id: 7,
        plugins: [("search".to_string(), false)].into(),
        params: [("temperature".to_string(), 0.7)].into(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MOSS client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn moss_stage_posts_flattened_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/infer"))
        .and(body_partial_json(serde_json::json!({
            "session_id": 7,
            "search": false,
            "temperature": 0.7,
            "url": "ws://gw/v1/callback/ws?uuid=u1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "pred": "",
            "new_generations": " None<eot>\n<|Commands|>: None<eoc>",
            "input_token_num": 12,
            "new_generations_token_num": 8,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let client = registry
        .moss(&model(ApiType::Moss, format!("{}/infer", server.uri())))
        .unwrap();
    let resp = client.infer(&stage_request()).await.unwrap();
    assert_eq!(resp.new_generations, " None<eot>\n<|Commands|>: None<eoc>");
    assert_eq!(resp.new_generations_token_num, 8);
}

#[tokio::test]
async fn moss_upstream_400_is_max_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let client = registry.moss(&model(ApiType::Moss, server.uri())).unwrap();
    let err = client.infer(&stage_request()).await.unwrap_err();
    assert!(matches!(err, Error::MaxInputExceeded));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn moss_in_band_560_is_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("560"))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let client = registry.moss(&model(ApiType::Moss, server.uri())).unwrap();
    let err = client.infer(&stage_request()).await.unwrap_err();
    assert!(matches!(err, Error::Unknown(_)));
}

#[tokio::test]
async fn moss_503_is_internal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let client = registry.moss(&model(ApiType::Moss, server.uri())).unwrap();
    assert!(matches!(client.infer(&stage_request()).await, Err(Error::Internal(_))));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OpenAI-compatible streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn openai_stream_yields_tokens_then_done() {
    let server = MockServer::start().await;
    let sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"there!\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"model": "moss-moon", "stream": true, "stop": ["<eom>"]})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let streamer = registry
        .streamer(&model(ApiType::Openai, format!("{}/v1", server.uri())))
        .unwrap();
    let req = ChatStreamRequest {
        messages: vec![Message::user("hello")],
        stop: vec!["<eom>".into()],
        ..Default::default()
    };
    let mut stream = streamer.chat_stream(&req).await.unwrap();

    let mut text = String::new();
    let mut done = 0;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            StreamEvent::Token { text: t } => text.push_str(&t),
            StreamEvent::Done { .. } => done += 1,
            StreamEvent::Error { message } => panic!("unexpected error {message}"),
        }
    }
    assert_eq!(text, "Hi there!");
    assert_eq!(done, 1);
}

#[tokio::test]
async fn openai_upstream_400_is_max_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("context length exceeded"))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let streamer = registry.streamer(&model(ApiType::Openai, server.uri())).unwrap();
    let err = streamer
        .chat_stream(&ChatStreamRequest::default())
        .await
        .err()
        .expect("request should fail");
    assert!(matches!(err, Error::MaxInputExceeded));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn openai_other_failures_are_internal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::new(5);
    let streamer = registry.streamer(&model(ApiType::Openai, server.uri())).unwrap();
    let err = streamer
        .chat_stream(&ChatStreamRequest::default())
        .await
        .err()
        .expect("request should fail");
    assert!(matches!(err, Error::Internal(_)));
    assert!(err.to_string().contains("429"));
    assert_eq!(err.client_message(), "internal server error");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP safety checker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn http_checker_reads_verdict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(serde_json::json!({"text": "bad sentence."})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sensitive": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sensitive": false})))
        .mount(&server)
        .await;

    let mut cfg = SensitiveConfig::default();
    cfg.checker.kind = CheckerKind::Http;
    cfg.checker.url = Some(format!("{}/check", server.uri()));
    let checker = mc_providers::sensitive::from_config(&cfg).unwrap();

    assert!(checker.is_sensitive("bad sentence.").await.unwrap());
    assert!(!checker.is_sensitive("good sentence.").await.unwrap());
}
