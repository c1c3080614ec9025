use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offense accounting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffenseConfig {
    #[serde(default = "d_300")]
    pub window_secs: u64,
    #[serde(default = "d_3")]
    pub prompt_threshold: usize,
    #[serde(default = "d_10")]
    pub response_threshold: usize,
}

impl Default for OffenseConfig {
    fn default() -> Self {
        Self {
            window_secs: d_300(),
            prompt_threshold: d_3(),
            response_threshold: d_10(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream rate / health limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "d_40")]
    pub rate_per_second: u32,
    #[serde(default = "d_60")]
    pub burst: u32,
    /// Rolling window of upstream outcomes.
    #[serde(default = "d_30")]
    pub window_secs: u64,
    /// Failures in the window needed before the ratio is considered.
    #[serde(default = "d_10")]
    pub min_failures: usize,
    #[serde(default = "d_ratio")]
    pub max_failure_ratio: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_second: d_40(),
            burst: d_60(),
            window_secs: d_30(),
            min_failures: d_10(),
            max_failure_ratio: d_ratio(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3() -> usize {
    3
}
fn d_10() -> usize {
    10
}
fn d_30() -> u64 {
    30
}
fn d_40() -> u32 {
    40
}
fn d_60() -> u32 {
    60
}
fn d_300() -> u64 {
    300
}
fn d_ratio() -> f64 {
    0.5
}
