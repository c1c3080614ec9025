//! API authentication.
//!
//! mosschat sits behind an API gateway that verifies the end user's JWT.
//! Two things are checked here:
//! - The gateway itself: the env var named by `config.server.api_token_env`
//!   is read **once at startup** and its SHA-256 digest cached in
//!   `AppState`. When set, every protected request must carry
//!   `Authorization: Bearer <token>`. When unset the server runs in dev
//!   mode and lets requests through.
//! - The end user: the gateway forwards the verified user id in the header
//!   named by `config.server.user_header`. [`AuthUser`] extracts it.

use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Axum middleware that enforces bearer-token authentication on protected
/// routes. Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Compare fixed-length digests in constant time.
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return unauthorized("invalid or missing API token");
    }

    next.run(req).await
}

/// The authenticated end user of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub i64);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = state.config.server.user_header.as_str();
        let raw = parts
            .headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or("");
        match raw.parse::<i64>() {
            Ok(id) if id > 0 => Ok(AuthUser(id)),
            _ => {
                tracing::debug!(header, "request without a valid user id");
                Err(unauthorized("missing or invalid user identity"))
            }
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
