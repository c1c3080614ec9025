pub mod config;

use clap::{Parser, Subcommand};

/// mosschat: inference orchestrator for the MOSS conversational assistant.
#[derive(Debug, Parser)]
#[command(name = "mosschat", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `MOSSCHAT_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used. A missing file yields the defaults.
///
/// [`Config`]: mc_domain::config::Config
pub fn load_config() -> anyhow::Result<(mc_domain::config::Config, String)> {
    let config_path =
        std::env::var("MOSSCHAT_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = load_config_from(&config_path)?;
    Ok((config, config_path))
}

pub fn load_config_from(config_path: &str) -> anyhow::Result<mc_domain::config::Config> {
    if !std::path::Path::new(config_path).exists() {
        return Ok(mc_domain::config::Config::default());
    }
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
    toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))
}
