/// Shared error type used across all mosschat crates.
///
/// The first group of variants are the client-visible error kinds of an
/// inference turn; the rest are plumbing failures that surface as
/// [`Error::Internal`]-class responses.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Upstream rejected the prompt as too long (HTTP 400 or a `"400"` body).
    #[error("max input length exceeded")]
    MaxInputExceeded,

    /// The safety filter flagged content; the refusal frame was already sent.
    #[error("sensitive content")]
    Sensitive,

    /// The client interrupted or disconnected.
    #[error("client interrupt")]
    Interrupt,

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("internal server error: {0}")]
    Internal(String),

    #[error("invalid command format: {0}")]
    InvalidCommandFormat(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Guidance returned to the client when the prompt no longer fits the model.
pub const MAX_INPUT_MESSAGE: &str =
    "The conversation is too long for the model. Please start a new chat or shorten your message.";

impl Error {
    /// HTTP / frame status code visible to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadRequest(_) | Error::MaxInputExceeded => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            // Sensitive and Interrupt never produce an error frame of their own.
            Error::Sensitive | Error::Interrupt => 200,
            _ => 500,
        }
    }

    /// Text safe to show to an end user.
    ///
    /// Internal details of 5xx-class failures are logged, never sent.
    pub fn client_message(&self) -> String {
        match self {
            Error::BadRequest(m) | Error::Unauthorized(m) | Error::Forbidden(m) => m.clone(),
            Error::MaxInputExceeded => MAX_INPUT_MESSAGE.to_string(),
            Error::Interrupt => "client interrupt".to_string(),
            Error::Sensitive => "sensitive content".to_string(),
            _ => "internal server error".to_string(),
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(Error::BadRequest("x".into()).status_code(), 400);
        assert_eq!(Error::MaxInputExceeded.status_code(), 400);
        assert_eq!(Error::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
        assert_eq!(Error::Unknown("x".into()).status_code(), 500);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
        assert_eq!(Error::Timeout("x".into()).status_code(), 500);
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let err = Error::Internal("dial tcp 10.0.0.3:8080: refused".into());
        assert_eq!(err.client_message(), "internal server error");
        assert!(Error::MaxInputExceeded.client_message().contains("too long"));
    }
}
