//! Chat endpoints needed to drive the inference routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use mc_domain::error::Error;
use mc_domain::model::Chat;

use crate::state::AppState;

use super::auth::AuthUser;
use super::error::ApiResult;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/chats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_chat(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<impl IntoResponse> {
    state.store.get_or_create_user(user_id)?;
    let chat = state.store.create_chat(user_id)?;
    tracing::info!(user_id, chat_id = chat.id, "chat created");
    Ok((StatusCode::CREATED, Json(chat)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/chats/:chat_id/records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_records(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let chat = owned_chat(&state, user_id, chat_id)?;
    let records = state.store.records(chat.id);
    Ok(Json(serde_json::json!({
        "chat": chat,
        "records": records,
    })))
}

/// Look up a chat and check that `user_id` owns it.
pub(crate) fn owned_chat(state: &AppState, user_id: i64, chat_id: i64) -> Result<Chat, Error> {
    let chat = state
        .store
        .get_chat(chat_id)
        .ok_or_else(|| Error::BadRequest(format!("chat {chat_id} not found")))?;
    if chat.user_id != user_id {
        return Err(Error::Forbidden("chat belongs to another user".into()));
    }
    Ok(chat)
}
