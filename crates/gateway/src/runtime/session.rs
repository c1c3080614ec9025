//! Session driver for one client inference connection.
//!
//! Validates the chat and user, reads the request (or picks up the last one
//! for a regenerate), runs the turn on its own task and races it against
//! the client's interrupt signal. Whatever way the session ends, the
//! connection guard is closed so listeners and tool requests unwind.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use mc_domain::error::{Error, Result};
use mc_domain::frame::{ChatRequestFrame, ClientControlFrame, ServerFrame};
use mc_domain::model::{OffenseType, Record, User};
use mc_domain::trace::TraceEvent;

use crate::state::AppState;

use super::cancel::ConnectionGuard;
use super::orchestrator::TurnInput;
use super::FrameSender;

/// How long an interrupted turn may take to unwind on its own before its
/// task is aborted.
const INTERRUPT_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    NewRecord,
    /// Re-run the chat's last request in place of its last record.
    Regenerate,
}

/// Client → server traffic, as seen by the driver.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Status 0 and the record were sent.
    Completed,
    /// A `-2` frame was sent.
    Refused,
    /// An error frame was sent.
    Failed,
    /// The client interrupted or went away; nothing further was sent.
    Interrupted,
}

/// Drive one session to its end.
pub async fn run_session(
    state: &AppState,
    user_id: i64,
    chat_id: i64,
    kind: SessionKind,
    mut inbound: mpsc::Receiver<Inbound>,
    out: FrameSender,
) -> SessionEnd {
    let end = match drive(state, user_id, chat_id, kind, &mut inbound, &out).await {
        Ok(end) => end,
        Err(Error::Interrupt) => SessionEnd::Interrupted,
        Err(e) => {
            if e.status_code() >= 500 {
                tracing::error!(user_id, chat_id, error = %e, "inference session failed");
            } else {
                tracing::info!(user_id, chat_id, error = %e, "inference session rejected");
            }
            match out.frame(ServerFrame::error(e.status_code(), e.client_message())).await {
                Ok(()) => SessionEnd::Failed,
                Err(_) => SessionEnd::Interrupted,
            }
        }
    };
    tracing::debug!(user_id, chat_id, kind = ?kind, end = ?end, "inference session finished");
    end
}

async fn drive(
    state: &AppState,
    user_id: i64,
    chat_id: i64,
    kind: SessionKind,
    inbound: &mut mpsc::Receiver<Inbound>,
    out: &FrameSender,
) -> Result<SessionEnd> {
    let chat = state
        .store
        .get_chat(chat_id)
        .ok_or_else(|| Error::BadRequest(format!("chat {chat_id} not found")))?;
    if chat.user_id != user_id {
        return Err(Error::Forbidden("chat belongs to another user".into()));
    }

    let user = state.store.get_or_create_user(user_id)?;
    let site = state.site.get();
    let model = site
        .resolve_model(user.model_id)
        .cloned()
        .ok_or_else(|| Error::Internal("no inference backend configured".into()))?;
    let user = state.store.sync_plugin_config(user_id, &model.default_plugin_config)?;

    if user.banned {
        out.frame(ServerFrame::sensitive(state.config.sensitive.ban_notice.clone())).await?;
        return Ok(SessionEnd::Refused);
    }

    let (request, params) = match kind {
        SessionKind::NewRecord => {
            let Some(frame) = first_request(inbound).await? else {
                return Ok(SessionEnd::Interrupted);
            };
            let checked = model.enable_sensitive_check && !user.disable_sensitive_check;
            if checked && request_is_sensitive(state, &frame.request).await {
                return refuse_request(state, &user, chat_id, model.id, frame.request, out).await;
            }
            (frame.request, frame.param)
        }
        SessionKind::Regenerate => {
            let last = state
                .store
                .last_record(chat_id)
                .ok_or_else(|| Error::BadRequest("nothing to regenerate".into()))?;
            if last.request_sensitive {
                out.frame(ServerFrame::sensitive(state.config.sensitive.default_refusal.clone()))
                    .await?;
                return Ok(SessionEnd::Refused);
            }
            state.store.delete_last_record(chat_id).await?;
            tracing::info!(chat_id, record_id = last.id, "regenerating last record");
            (last.request, HashMap::new())
        }
    };

    let input = TurnInput {
        user,
        chat_id,
        model,
        request,
        params,
    };
    race_turn(state, input, inbound, out).await
}

/// Wait for the first client frame of a new-record session.
async fn first_request(inbound: &mut mpsc::Receiver<Inbound>) -> Result<Option<ChatRequestFrame>> {
    match inbound.recv().await {
        Some(Inbound::Text(text)) => {
            let frame: ChatRequestFrame = serde_json::from_str(&text)
                .map_err(|e| Error::BadRequest(format!("invalid request frame: {e}")))?;
            if frame.request.trim().is_empty() {
                return Err(Error::BadRequest("request must not be empty".into()));
            }
            Ok(Some(frame))
        }
        Some(Inbound::Closed) | None => Ok(None),
    }
}

async fn request_is_sensitive(state: &AppState, request: &str) -> bool {
    state.checker.is_sensitive(request).await.unwrap_or_else(|e| {
        tracing::warn!(checker = state.checker.name(), error = %e, "request check failed, passing request");
        false
    })
}

/// Persist a refused request and answer it with a `-2` frame. The record
/// keeps the previous prefix so the refused turn never reaches a prompt.
async fn refuse_request(
    state: &AppState,
    user: &User,
    chat_id: i64,
    model_id: i64,
    request: String,
    out: &FrameSender,
) -> Result<SessionEnd> {
    let sensitive = &state.config.sensitive;
    let mut record = Record::new(chat_id, request, model_id);
    record.request_sensitive = true;
    record.response = sensitive.default_refusal.clone();
    record.prefix = state
        .store
        .last_record(chat_id)
        .map(|r| r.prefix)
        .unwrap_or_default();
    state
        .store
        .persist_turn(record, state.config.inference.chat_name_chars)
        .await?;

    TraceEvent::SensitiveHit {
        user_id: user.id,
        chat_id,
        side: "request".into(),
    }
    .emit();
    let banned = state
        .offense
        .add_offense(user.id, OffenseType::PromptOffense)
        .unwrap_or_else(|e| {
            tracing::error!(user_id = user.id, error = %e, "failed to record offense");
            false
        });
    let message = if banned { &sensitive.ban_notice } else { &sensitive.default_refusal };
    out.frame(ServerFrame::sensitive(message.clone())).await?;
    Ok(SessionEnd::Refused)
}

/// Run the turn on its own task while watching the client for an interrupt.
async fn race_turn(
    state: &AppState,
    input: TurnInput,
    inbound: &mut mpsc::Receiver<Inbound>,
    out: &FrameSender,
) -> Result<SessionEnd> {
    let guard = ConnectionGuard::new();
    let orchestrator = state.orchestrator.clone();
    let frames = out.gated(guard.observer());
    let cancel = guard.observer();
    let mut task = tokio::spawn(async move {
        AssertUnwindSafe(orchestrator.run_turn(input, frames, cancel))
            .catch_unwind()
            .await
    });

    loop {
        tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(Ok(Ok(record))) => {
                        out.record(record).await?;
                        Ok(SessionEnd::Completed)
                    }
                    Ok(Ok(Err(Error::Sensitive))) => Ok(SessionEnd::Refused),
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(panic)) => {
                        tracing::error!(panic = %panic_message(panic.as_ref()), "turn panicked");
                        Err(Error::Unknown("turn panicked".into()))
                    }
                    Err(e) => Err(Error::Unknown(format!("turn task failed: {e}"))),
                };
            }
            msg = inbound.recv() => match msg {
                Some(Inbound::Text(text)) => match serde_json::from_str::<ClientControlFrame>(&text) {
                    Ok(ctrl) if ctrl.interrupt => break,
                    Ok(_) => {}
                    Err(e) => tracing::debug!(error = %e, "ignoring unreadable client frame"),
                },
                Some(Inbound::Closed) | None => break,
            },
        }
    }

    guard.close();
    tracing::info!("client interrupt");
    if tokio::time::timeout(INTERRUPT_DRAIN, &mut task).await.is_err() {
        tracing::warn!(drain_secs = INTERRUPT_DRAIN.as_secs(), "interrupted turn did not unwind, aborting");
        task.abort();
    }
    Ok(SessionEnd::Interrupted)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
