//! Client inference WebSockets.
//!
//! `GET /v1/chats/:chat_id/records/ws` starts a new turn from the client's
//! first frame; `GET /v1/chats/:chat_id/regenerate/ws` re-runs the chat's
//! last request. Both stream [`ServerFrame`](mc_domain::frame::ServerFrame)s
//! and accept `{"interrupt": true}` at any time.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::runtime::session::{run_session, Inbound, SessionKind};
use crate::runtime::{FrameSender, Outbound};
use crate::state::AppState;

use super::auth::AuthUser;

/// Buffered client frames; the client only ever sends a request and an
/// interrupt.
const INBOUND_BUFFER: usize = 8;

pub async fn new_record_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, chat_id, SessionKind::NewRecord))
}

pub async fn regenerate_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(chat_id): Path<i64>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, chat_id, SessionKind::Regenerate))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64, chat_id: i64, kind: SessionKind) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (frames, mut outbound_rx) = FrameSender::channel(state.config.inference.frame_buffer);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    // Writer task: forwards outbound frames to the WS sink, then closes it
    // once every sender is gone.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_outbound(&mut ws_sink, &msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    // Reader task: a close, a transport error or the end of the stream all
    // count as the client going away.
    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_stream.next().await {
            let inbound = match msg {
                Ok(Message::Text(text)) => Inbound::Text(text),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if inbound_tx.send(inbound).await.is_err() {
                return;
            }
        }
        let _ = inbound_tx.send(Inbound::Closed).await;
    });

    tracing::info!(user_id, chat_id, kind = ?kind, "inference session opened");
    let end = run_session(&state, user_id, chat_id, kind, inbound_rx, frames).await;

    reader.abort();
    let _ = writer.await;
    tracing::info!(user_id, chat_id, end = ?end, "inference session closed");
}

async fn send_outbound(sink: &mut (impl SinkExt<Message> + Unpin), msg: &Outbound) -> Result<(), ()> {
    let json = match msg {
        Outbound::Frame(frame) => serde_json::to_string(frame),
        Outbound::Record(record) => serde_json::to_string(record),
    }
    .map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}
