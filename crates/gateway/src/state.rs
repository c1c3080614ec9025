use std::sync::Arc;

use mc_domain::config::Config;
use mc_providers::{BackendResolver, SensitiveChecker};
use mc_sessions::{ChatStore, OffenseAccounting};

use crate::runtime::callbacks::CallbackRegistry;
use crate::runtime::limiter::InferLimiter;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::site_cache::SiteConfigCache;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services**: config, persistence, site config
/// - **Inference**: backends, callback registry, orchestrator, limiter
/// - **Safety**: sensitive checker, offense accounting
/// - **Security**: bearer token hash
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<ChatStore>,
    pub site: Arc<SiteConfigCache>,

    // ── Inference ─────────────────────────────────────────────────────
    pub backends: Arc<dyn BackendResolver>,
    /// Correlation uuid → callback channel of a running stage.
    pub callbacks: Arc<CallbackRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    /// Consulted before every OpenAI-style completion.
    pub limiter: Arc<InferLimiter>,

    // ── Safety ────────────────────────────────────────────────────────
    pub checker: Arc<dyn SensitiveChecker>,
    pub offense: Arc<OffenseAccounting>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,
}
