//! MOSS callback WebSocket.
//!
//! The inference backend connects to the URL it was handed in the stage
//! POST (`/v1/callback/ws?uuid=…`) and streams its generation frames here.
//! Each frame is normalized and routed to the stage's slot in the callback
//! registry.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use mc_domain::frame::CallbackFrame;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub uuid: Option<String>,
}

/// `GET /v1/callback/ws?uuid=<uuid>`
///
/// A missing, malformed or unregistered uuid is rejected before the upgrade.
pub async fn callback_ws(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let uuid = match query.uuid.as_deref().map(Uuid::parse_str) {
        Some(Ok(uuid)) => uuid,
        Some(Err(_)) | None => return bad_request("missing or malformed uuid"),
    };
    if !state.callbacks.contains(&uuid) {
        tracing::warn!(uuid = %uuid, "callback for unknown uuid");
        return bad_request("unknown uuid");
    }
    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(serde_json::json!({ "error": "websocket upgrade required" })),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, uuid))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, uuid: Uuid) {
    tracing::debug!(uuid = %uuid, "callback stream opened");
    let mut delivered = 0usize;
    let mut dropped = 0usize;
    let mut slot_gone = false;

    while let Some(Ok(msg)) = socket.next().await {
        let frame = match msg {
            Message::Text(text) => serde_json::from_str::<CallbackFrame>(&text),
            Message::Binary(bytes) => serde_json::from_slice::<CallbackFrame>(&bytes),
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match frame {
            Ok(frame) => frame.post_process(),
            Err(e) => {
                tracing::debug!(uuid = %uuid, error = %e, "ignoring unparseable callback frame");
                continue;
            }
        };
        // Once the slot is gone the rest of the stream is discarded quietly.
        if slot_gone {
            dropped += 1;
            continue;
        }
        match state.callbacks.deliver(&uuid, frame).await {
            Ok(()) => delivered += 1,
            Err(_) => {
                slot_gone = true;
                dropped += 1;
            }
        }
    }

    tracing::debug!(uuid = %uuid, delivered, dropped, "callback stream closed");
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
