use mc_domain::config::{Config, ConfigSeverity};

/// Parse and validate the config, printing any issues.
///
/// Returns `false` when at least one error was found.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!(
        "\n{} error(s), {} warning(s) in {config_path}",
        error_count, warning_count,
    );

    error_count == 0
}

/// Render the resolved config (with all defaults filled in) as TOML.
///
/// API keys are never part of the config (only the names of the env vars
/// holding them), so the output is safe to share.
pub fn show(config: &Config) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serializing config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shown_config_parses_back() {
        let cfg = Config::default();
        let text = show(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.inference.callback_idle_timeout_secs, 90);
        assert_eq!(parsed.limiter.burst, 60);
    }

    #[test]
    fn invalid_port_fails_validation() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(!validate(&cfg, "config.toml"));
    }
}
