use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Endpoints of the external tool services. A missing URL makes the
/// corresponding action resolve to `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub calculate_url: Option<String>,
    #[serde(default)]
    pub solve_url: Option<String>,
    #[serde(default)]
    pub draw_url: Option<String>,
    #[serde(default = "d_20")]
    pub timeout_secs: u64,
    /// Hits requested per search.
    #[serde(default = "d_topk")]
    pub search_topk: u32,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            calculate_url: None,
            solve_url: None,
            draw_url: None,
            timeout_secs: d_20(),
            search_topk: d_topk(),
        }
    }
}

fn d_20() -> u64 {
    20
}
fn d_topk() -> u32 {
    3
}
