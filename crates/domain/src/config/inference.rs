use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inference
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Maximum silence on a callback channel before the stage fails.
    #[serde(default = "d_90")]
    pub callback_idle_timeout_secs: u64,
    /// Deadline for one upstream stage POST.
    #[serde(default = "d_300")]
    pub upstream_timeout_secs: u64,
    /// Buffered callback frames per correlation id.
    #[serde(default = "d_100")]
    pub frame_buffer: usize,
    /// How long the stage-2 listener may keep draining after the POST returned.
    #[serde(default = "d_grace")]
    pub post_stream_grace_ms: u64,
    /// Chat names are the first request truncated to this many characters.
    #[serde(default = "d_20")]
    pub chat_name_chars: usize,
    /// Numeric sampling parameters copied into every MOSS request.
    #[serde(default = "d_sampling")]
    pub sampling: BTreeMap<String, f64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            callback_idle_timeout_secs: d_90(),
            upstream_timeout_secs: d_300(),
            frame_buffer: d_100(),
            post_stream_grace_ms: d_grace(),
            chat_name_chars: d_20(),
            sampling: d_sampling(),
        }
    }
}

impl InferenceConfig {
    /// Sampling parameters with the client's overrides applied.
    /// Keys that are not configured are ignored.
    pub fn sampling_with<'a, I>(&self, overrides: I) -> BTreeMap<String, f64>
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        let mut params = self.sampling.clone();
        for (k, v) in overrides {
            if let Some(slot) = params.get_mut(k) {
                *slot = *v;
            }
        }
        params
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_90() -> u64 {
    90
}
fn d_300() -> u64 {
    300
}
fn d_100() -> usize {
    100
}
fn d_grace() -> u64 {
    2_000
}
fn d_20() -> usize {
    20
}
fn d_sampling() -> BTreeMap<String, f64> {
    [
        ("temperature", 0.7),
        ("top_p", 0.8),
        ("top_k", 40.0),
        ("repetition_penalty", 1.02),
        ("max_time", 60.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overrides_only_touch_configured_keys() {
        let cfg = InferenceConfig::default();
        let overrides: HashMap<String, f64> =
            [("temperature".to_string(), 0.1), ("bogus".to_string(), 9.0)].into();

        let params = cfg.sampling_with(&overrides);

        assert_eq!(params["temperature"], 0.1);
        assert_eq!(params["top_p"], 0.8);
        assert!(!params.contains_key("bogus"));
    }
}
