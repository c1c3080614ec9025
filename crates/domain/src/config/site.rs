use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Site
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Seed values for the persisted site config, and its cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSection {
    #[serde(default)]
    pub invite_required: bool,
    #[serde(default)]
    pub notice: String,
    #[serde(default = "d_ttl")]
    pub cache_ttl_secs: u64,
    /// Uniform random jitter added to or subtracted from the TTL.
    #[serde(default = "d_jitter")]
    pub cache_jitter_secs: u64,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            invite_required: false,
            notice: String::new(),
            cache_ttl_secs: d_ttl(),
            cache_jitter_secs: d_jitter(),
        }
    }
}

fn d_ttl() -> u64 {
    24 * 60 * 60
}
fn d_jitter() -> u64 {
    60 * 60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the JSON state file.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}
