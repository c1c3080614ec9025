use mc_domain::config::{CheckerKind, Config};
use mc_domain::model::ApiType;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
}

#[test]
fn default_cors_allows_only_localhost() {
    let config = Config::default();
    assert!(config.server.cors.allowed_origins.contains(&"http://localhost:*".to_string()));
    assert!(config.server.cors.allowed_origins.contains(&"http://127.0.0.1:*".to_string()));
}

#[test]
fn inference_timeouts_default() {
    let config = Config::default();
    assert_eq!(config.inference.callback_idle_timeout_secs, 90);
    assert_eq!(config.inference.upstream_timeout_secs, 300);
    assert_eq!(config.inference.frame_buffer, 100);
    assert_eq!(config.tools.timeout_secs, 20);
}

#[test]
fn guardrail_thresholds_default() {
    let config = Config::default();
    assert_eq!(config.offense.window_secs, 300);
    assert_eq!(config.offense.prompt_threshold, 3);
    assert_eq!(config.offense.response_threshold, 10);
    assert_eq!(config.limiter.rate_per_second, 40);
    assert_eq!(config.limiter.burst, 60);
    assert_eq!(config.limiter.window_secs, 30);
    assert_eq!(config.limiter.min_failures, 10);
}

#[test]
fn segment_terminators_include_cjk_punctuation() {
    let config = Config::default();
    for c in [',', '.', '?', '!', '\n', '，', '。', '？', '！'] {
        assert!(config.sensitive.terminators.contains(c), "missing {c:?}");
    }
    assert_eq!(config.sensitive.checker.kind, CheckerKind::None);
}

#[test]
fn full_model_table_parses() {
    let toml_str = r#"
default_model_id = 2

[[models]]
id = 1
url = "http://moss:8080/infer"
callback_url = "ws://gateway:8000/v1/callback/ws"
end_delimiter = "<eom>"
default_plugin_config = { search = true, calculator = true, equation = false, "text-to-image" = false }

[[models]]
id = 2
url = "http://vllm:8000/v1/chat/completions"
api_type = "openai"
openai_model = "moss-moon-003"
openai_system_prompt = "You are MOSS."
api_key_env = "VLLM_KEY"
enable_sensitive_check = false
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.models.len(), 2);
    assert_eq!(config.models[0].api_type, ApiType::Moss);
    assert!(config.models[0].inner_thoughts_postprocess);
    assert_eq!(config.models[0].default_plugin_config.get("search"), Some(&true));
    assert_eq!(config.models[1].api_type, ApiType::Openai);
    assert!(!config.models[1].enable_sensitive_check);
    assert!(config.validate().is_empty());
}
