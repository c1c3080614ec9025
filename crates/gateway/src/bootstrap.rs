//! AppState construction extracted from `main.rs`.
//!
//! [`build_app_state`] is the boot path of `serve`. Tests call
//! [`build_app_state_with`] to swap the outbound clients (inference
//! backends, tool services, safety checker) for in-process fakes.

use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};

use mc_domain::config::{Config, ConfigSeverity};
use mc_domain::model::SiteConfig;
use mc_providers::registry::ProviderRegistry;
use mc_providers::{sensitive, BackendResolver, SensitiveChecker};
use mc_sessions::{ChatStore, OffenseAccounting};
use mc_tools::{HttpToolBackend, ToolBackend, ToolDispatcher};

use crate::runtime::callbacks::CallbackRegistry;
use crate::runtime::limiter::InferLimiter;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::site_cache::SiteConfigCache;
use crate::state::AppState;

/// Clients for everything outside the process.
pub struct Dependencies {
    pub backends: Arc<dyn BackendResolver>,
    pub tools: Arc<dyn ToolBackend>,
    pub checker: Arc<dyn SensitiveChecker>,
}

impl Dependencies {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let backends = Arc::new(ProviderRegistry::new(config.inference.upstream_timeout_secs));
        let tools = Arc::new(HttpToolBackend::from_config(&config.tools).context("initializing tool clients")?);
        let checker = sensitive::from_config(&config.sensitive).context("initializing sensitive checker")?;
        tracing::info!(checker = checker.name(), "sensitive checker ready");
        Ok(Self {
            backends,
            tools,
            checker,
        })
    }
}

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let deps = Dependencies::from_config(&config)?;
    build_app_state_with(config, deps).await
}

/// Wire an [`AppState`] around the given outbound clients.
pub async fn build_app_state_with(config: Arc<Config>, deps: Dependencies) -> anyhow::Result<AppState> {
    // ── Chat store ───────────────────────────────────────────────────
    let store = Arc::new(
        ChatStore::open(&config.storage.state_path).context("opening chat store")?,
    );

    // ── Site config ──────────────────────────────────────────────────
    // Backends listed in the config file are authoritative; without any,
    // whatever was persisted earlier stays in effect.
    let site = SiteConfig {
        invite_required: config.site.invite_required,
        notice: config.site.notice.clone(),
        models: config.models.clone(),
        default_model_id: config.default_model_id,
    };
    if config.models.is_empty() {
        store.seed_site_config(site).context("seeding site config")?;
    } else {
        store.put_site_config(site).context("storing site config")?;
    }
    let site = Arc::new(SiteConfigCache::new(store.clone(), &config.site));
    tracing::info!(
        models = site.get().models.len(),
        ttl_secs = config.site.cache_ttl_secs,
        "site config cache ready"
    );

    // ── Inference runtime ────────────────────────────────────────────
    let callbacks = Arc::new(CallbackRegistry::new(config.inference.frame_buffer));
    let limiter = Arc::new(InferLimiter::new(&config.limiter));
    let offense = Arc::new(OffenseAccounting::new(store.clone(), config.offense.clone()));
    let tools = Arc::new(ToolDispatcher::new(deps.tools, config.tools.search_topk));
    let orchestrator = Arc::new(Orchestrator {
        store: store.clone(),
        backends: deps.backends.clone(),
        callbacks: callbacks.clone(),
        tools,
        checker: deps.checker.clone(),
        offense: offense.clone(),
        limiter: limiter.clone(),
        inference: config.inference.clone(),
        sensitive: config.sensitive.clone(),
    });
    tracing::info!(
        idle_secs = config.inference.callback_idle_timeout_secs,
        upstream_timeout_secs = config.inference.upstream_timeout_secs,
        "inference runtime ready"
    );

    // ── API bearer token (read once, hash for constant-time compare) ──
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var) {
            Ok(t) if !t.is_empty() => {
                tracing::info!(env_var = %env_var, "API bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    "API bearer-token auth DISABLED: set the {env_var} env var to require a token"
                );
                None
            }
        }
    };

    Ok(AppState {
        config,
        store,
        site,
        backends: deps.backends,
        callbacks,
        orchestrator,
        limiter,
        checker: deps.checker,
        offense,
        api_token_hash,
    })
}
