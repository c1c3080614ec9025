pub mod auth;
pub mod callback;
pub mod chat_ws;
pub mod chats;
pub mod error;
pub mod health;
pub mod openai_compat;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware). The MOSS callback socket is
/// public: backends authenticate by knowing a live correlation uuid.
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(health::health))
        .route("/v1/callback/ws", get(callback::callback_ws));

    let protected = Router::new()
        // Chats
        .route("/v1/chats", post(chats::create_chat))
        .route("/v1/chats/:chat_id/records", get(chats::list_records))
        // Inference sessions
        .route("/v1/chats/:chat_id/records/ws", get(chat_ws::new_record_ws))
        .route("/v1/chats/:chat_id/regenerate/ws", get(chat_ws::regenerate_ws))
        // OpenAI-compatible
        .route("/v1/chat/completions", post(openai_compat::chat_completions))
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_token));

    public.merge(protected)
}
