//! Shared utility functions for upstream clients.

use mc_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Read an API key from the named environment variable.
///
/// `None` means the backend is unauthenticated (self-hosted vLLM and the like).
pub fn resolve_api_key(env_var: Option<&str>) -> Result<Option<String>> {
    let Some(var) = env_var.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    std::env::var(var)
        .map(Some)
        .map_err(|_| Error::Config(format!("environment variable '{var}' not set or not valid UTF-8")))
}

/// Build a `reqwest::Client` with a whole-request timeout.
pub(crate) fn client_with_timeout(secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(secs))
        .build()
        .map_err(from_reqwest)
}
