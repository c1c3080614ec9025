//! Streaming turn against an OpenAI-compatible backend.
//!
//! Token deltas are accumulated and offered to the sensitive filter, which
//! releases sentence-aligned prefixes as MOSS-shaped partial frames. The
//! caller sends the closing frame with the returned text.

use futures_util::StreamExt;

use mc_domain::error::{Error, Result};
use mc_domain::stream::StreamEvent;
use mc_providers::{ChatStreamRequest, ChatStreamer};

use super::cancel::CancelObserver;
use super::filter::SensitiveFilter;

/// Run one streamed completion. Returns the final text, cut at the end
/// delimiter.
pub async fn stream_chat(
    streamer: &dyn ChatStreamer,
    req: &ChatStreamRequest,
    filter: &mut SensitiveFilter,
    cancel: &CancelObserver,
) -> Result<String> {
    let mut stream = streamer.chat_stream(req).await?;
    let mut result = String::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Interrupt);
        }
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Interrupt),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(StreamEvent::Token { text })) => {
                result.push_str(&text);
                filter.feed(&result).await?;
                if filter.terminated() {
                    tracing::debug!(provider = streamer.provider_id(), "end delimiter reached");
                    break;
                }
            }
            Some(Ok(StreamEvent::Done { finish_reason, .. })) => {
                tracing::debug!(provider = streamer.provider_id(), finish_reason = ?finish_reason, "stream done");
                break;
            }
            None => break,
            Some(Ok(StreamEvent::Error { message })) => {
                return Err(Error::Internal(format!("upstream stream error: {message}")));
            }
            Some(Err(e @ Error::MaxInputExceeded)) => return Err(e),
            Some(Err(e)) => return Err(Error::Internal(e.to_string())),
        }
    }

    let final_text = filter.truncate(&result).0.to_string();
    filter.finish(&final_text).await?;
    Ok(final_text)
}
