//! Upstream MOSS inference client.
//!
//! One POST per stage. The backend answers with the complete generation once
//! it is done; the incremental tokens travel over the callback socket.

use std::time::Instant;

use mc_domain::error::{Error, Result};
use mc_domain::model::ModelConfig;

use crate::traits::{MossBackend, MossRequest, MossResponse};
use crate::util::client_with_timeout;

/// Status the MOSS backend uses for an unrecoverable generation failure.
const STATUS_MOSS_UNKNOWN: u16 = 560;

pub struct MossClient {
    model_id: i64,
    url: String,
    client: reqwest::Client,
}

impl MossClient {
    pub fn from_config(model: &ModelConfig, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            model_id: model.id,
            url: model.url.clone(),
            client: client_with_timeout(timeout_secs)?,
        })
    }
}

/// Map an upstream status and body onto the stage outcome.
///
/// The backend sometimes reports failures in-band: a 200 whose body is the
/// bare text `400` or `560` instead of JSON.
fn classify(status: u16, body: &str) -> Result<MossResponse> {
    match status {
        200 => match serde_json::from_str::<MossResponse>(body) {
            Ok(resp) => Ok(resp),
            Err(e) => match body.trim() {
                "400" => Err(Error::MaxInputExceeded),
                "560" => Err(Error::Unknown("upstream reported 560".into())),
                _ => Err(Error::Internal(format!("unparseable upstream body: {e}"))),
            },
        },
        400 => Err(Error::MaxInputExceeded),
        STATUS_MOSS_UNKNOWN => Err(Error::Unknown(format!("upstream 560: {}", body.trim()))),
        other => Err(Error::Internal(format!("upstream HTTP {other}: {}", body.trim()))),
    }
}

#[async_trait::async_trait]
impl MossBackend for MossClient {
    async fn infer(&self, req: &MossRequest) -> Result<MossResponse> {
        let started = Instant::now();
        tracing::debug!(model_id = self.model_id, url = %self.url, session_id = req.session_id, "moss stage request");

        let resp = self
            .client
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("upstream request failed: {e}")))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Internal(format!("upstream body read failed: {e}")))?;

        tracing::info!(
            model_id = self.model_id,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "moss stage response"
        );
        classify(status, &body)
    }

    fn model_id(&self) -> i64 {
        self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parseable_200_is_success() {
        let body = r#"{"pred":"p","new_generations":" Hi<eom>","input_token_num":3,"new_generations_token_num":2}"#;
        let resp = classify(200, body).unwrap();
        assert_eq!(resp.new_generations, " Hi<eom>");
        assert_eq!(resp.input_token_num, 3);
    }

    #[test]
    fn in_band_status_bodies_are_mapped() {
        assert!(matches!(classify(200, "400"), Err(Error::MaxInputExceeded)));
        assert!(matches!(classify(200, " 560\n"), Err(Error::Unknown(_))));
        assert!(matches!(classify(200, "garbage"), Err(Error::Internal(_))));
    }

    #[test]
    fn http_statuses_are_mapped() {
        assert!(matches!(classify(400, ""), Err(Error::MaxInputExceeded)));
        assert!(matches!(classify(560, ""), Err(Error::Unknown(_))));
        assert!(matches!(classify(502, "bad gateway"), Err(Error::Internal(_))));
        assert!(matches!(classify(503, ""), Err(Error::Internal(_))));
    }
}
