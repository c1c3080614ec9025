//! HTTP clients for the external tool services.

use std::fmt;
use std::time::Duration;

use mc_domain::config::ToolsConfig;
use mc_domain::error::{Error, Result};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub summary: String,
}

#[async_trait::async_trait]
pub trait ToolBackend: Send + Sync {
    async fn search(&self, query: &str, topk: u32) -> Result<Vec<SearchHit>>;
    /// Evaluate an arithmetic expression; the answer is returned verbatim.
    async fn calculate(&self, expression: &str) -> Result<String>;
    async fn solve(&self, problem: &str) -> Result<String>;
    /// Render an image; returns the encoded image bytes.
    async fn draw(&self, prompt: &str) -> Result<Vec<u8>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    topk: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { results: Vec<SearchHit> },
    Bare(Vec<SearchHit>),
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct TextResponse {
    result: serde_json::Value,
}

#[derive(Serialize)]
struct DrawRequest<'a> {
    prompt: &'a str,
}

/// Accepts msgpack `bin`, `str` or an array of integers.
struct ImageBytes(Vec<u8>);

impl<'de> Deserialize<'de> for ImageBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = ImageBytes;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("image bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<ImageBytes, E> {
                Ok(ImageBytes(v.to_vec()))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<ImageBytes, E> {
                Ok(ImageBytes(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ImageBytes, E> {
                Ok(ImageBytes(v.as_bytes().to_vec()))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<ImageBytes, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    out.push(b);
                }
                Ok(ImageBytes(out))
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}

fn result_text(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HttpToolBackend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpToolBackend {
    search_url: Option<String>,
    calculate_url: Option<String>,
    solve_url: Option<String>,
    draw_url: Option<String>,
    client: reqwest::Client,
}

impl HttpToolBackend {
    pub fn from_config(cfg: &ToolsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            search_url: cfg.search_url.clone(),
            calculate_url: cfg.calculate_url.clone(),
            solve_url: cfg.solve_url.clone(),
            draw_url: cfg.draw_url.clone(),
            client,
        })
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &Option<String>,
        tool: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("no endpoint configured for {tool}")))?;
        let resp = self.client.post(url).json(body).send().await.map_err(from_reqwest)?;
        check_status(tool, resp)
    }
}

fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

fn check_status(tool: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(Error::Http(format!("{tool} returned HTTP {}", resp.status().as_u16())))
    }
}

#[async_trait::async_trait]
impl ToolBackend for HttpToolBackend {
    async fn search(&self, query: &str, topk: u32) -> Result<Vec<SearchHit>> {
        let resp = self
            .post_json(&self.search_url, "search", &SearchRequest { query, topk })
            .await?;
        Ok(match resp.json::<SearchResponse>().await.map_err(from_reqwest)? {
            SearchResponse::Wrapped { results } => results,
            SearchResponse::Bare(hits) => hits,
        })
    }

    async fn calculate(&self, expression: &str) -> Result<String> {
        let resp = self
            .post_json(&self.calculate_url, "calculate", &TextRequest { text: expression })
            .await?;
        let body: TextResponse = resp.json().await.map_err(from_reqwest)?;
        Ok(result_text(body.result))
    }

    async fn solve(&self, problem: &str) -> Result<String> {
        let resp = self
            .post_json(&self.solve_url, "solve", &TextRequest { text: problem })
            .await?;
        let body: TextResponse = resp.json().await.map_err(from_reqwest)?;
        Ok(result_text(body.result))
    }

    async fn draw(&self, prompt: &str) -> Result<Vec<u8>> {
        let url = self
            .draw_url
            .as_deref()
            .ok_or_else(|| Error::Config("no endpoint configured for draw".into()))?;
        let payload = rmp_serde::to_vec_named(&DrawRequest { prompt })
            .map_err(|e| Error::Internal(format!("msgpack encode: {e}")))?;
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/msgpack")
            .body(payload)
            .send()
            .await
            .map_err(from_reqwest)?;
        let bytes = check_status("draw", resp)?
            .bytes()
            .await
            .map_err(from_reqwest)?;
        let image: ImageBytes = rmp_serde::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("msgpack decode: {e}")))?;
        Ok(image.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_bytes_decode_from_bin_and_str() {
        let bin = rmp_serde::to_vec(&serde_json::Value::Null).unwrap();
        assert!(rmp_serde::from_slice::<ImageBytes>(&bin).is_err());

        let mut packed = Vec::new();
        rmp_serde::encode::write(&mut packed, "png-bytes").unwrap();
        let decoded: ImageBytes = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(decoded.0, b"png-bytes");
    }

    #[test]
    fn numeric_results_are_stringified() {
        assert_eq!(result_text(serde_json::json!(14)), "14");
        assert_eq!(result_text(serde_json::json!("x = 2")), "x = 2");
    }
}
