use std::collections::BTreeMap;
use std::sync::Arc;

use mc_domain::config::ToolsConfig;
use mc_tools::{HttpToolBackend, ToolBackend, ToolDispatcher};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(base: &str) -> ToolsConfig {
    ToolsConfig {
        search_url: Some(format!("{base}/search")),
        calculate_url: Some(format!("{base}/calculate")),
        solve_url: Some(format!("{base}/solve")),
        draw_url: Some(format!("{base}/draw")),
        timeout_secs: 5,
        search_topk: 2,
    }
}

#[tokio::test]
async fn search_and_calculate_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_partial_json(serde_json::json!({"query": "rust", "topk": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                {"title": "Rust", "url": "https://rust-lang.org", "summary": "A language."},
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/calculate"))
        .and(body_partial_json(serde_json::json!({"text": "2+3*4"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": 14})))
        .mount(&server)
        .await;

    let backend = Arc::new(HttpToolBackend::from_config(&config(&server.uri())).unwrap());
    let dispatcher = ToolDispatcher::new(backend, 2);
    let plugins: BTreeMap<String, bool> =
        [("search".to_string(), true), ("calculator".to_string(), true)].into();

    let out = dispatcher
        .dispatch(r#"Search("rust"), Calculate("2+3*4")"#, &plugins)
        .await
        .unwrap();
    assert_eq!(out.result, "<|1|>: \"A language.\"\n14");
}

#[tokio::test]
async fn solver_error_marker_becomes_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/solve"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "[ERROR]"})))
        .mount(&server)
        .await;

    let backend = Arc::new(HttpToolBackend::from_config(&config(&server.uri())).unwrap());
    let dispatcher = ToolDispatcher::new(backend, 2);
    let plugins: BTreeMap<String, bool> = [("equation".to_string(), true)].into();
    let out = dispatcher.dispatch(r#"Solve("x+1=x")"#, &plugins).await.unwrap();
    assert_eq!(out.result, "None");
}

#[tokio::test]
async fn draw_speaks_msgpack() {
    let server = MockServer::start().await;
    let mut reply = Vec::new();
    rmp_serde::encode::write(&mut reply, "fake-png").unwrap();
    Mock::given(method("POST"))
        .and(path("/draw"))
        .and(header("content-type", "application/msgpack"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(reply))
        .mount(&server)
        .await;

    let backend = HttpToolBackend::from_config(&config(&server.uri())).unwrap();
    let image = backend.draw("a cat").await.unwrap();
    assert_eq!(image, b"fake-png");
}

#[tokio::test]
async fn http_failure_is_absorbed_by_dispatcher() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let backend = Arc::new(HttpToolBackend::from_config(&config(&server.uri())).unwrap());
    let dispatcher = ToolDispatcher::new(backend, 2);
    let plugins: BTreeMap<String, bool> = [("search".to_string(), true)].into();
    let out = dispatcher.dispatch(r#"Search("rust")"#, &plugins).await.unwrap();
    assert_eq!(out.result, "None");
    assert!(out.extra_data.is_empty());
}
