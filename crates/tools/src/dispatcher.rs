//! Concurrent execution of a parsed command list.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use mc_domain::error::Result;
use mc_domain::tool::ExtraData;
use mc_domain::trace::TraceEvent;
use serde_json::json;
use tracing::Instrument;

use crate::backend::{SearchHit, ToolBackend};
use crate::command::{parse_commands, Action, Command};

/// Result string fed back when a tool produced nothing usable.
pub const NONE_RESULT: &str = "None";
/// Fixed result text for a finished drawing.
pub const DRAW_RESULT: &str = "a picture of the given prompt has been finished";

/// Joined output of one command list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Newline-joined per-command results, or `None`.
    pub result: String,
    pub extra_data: Vec<ExtraData>,
    pub processed_extra_data: Vec<serde_json::Value>,
}

impl ToolOutput {
    pub fn none() -> Self {
        Self {
            result: NONE_RESULT.into(),
            ..Default::default()
        }
    }
}

/// What one command yielded before search hits are numbered.
enum Outcome {
    Search { query: String, hits: Vec<SearchHit> },
    Text { action: Action, request: String, result: String },
    Draw { prompt: String, image: Vec<u8> },
    Failed,
}

pub struct ToolDispatcher {
    backend: Arc<dyn ToolBackend>,
    search_topk: u32,
}

impl ToolDispatcher {
    pub fn new(backend: Arc<dyn ToolBackend>, search_topk: u32) -> Self {
        Self {
            backend,
            search_topk,
        }
    }

    /// Parse `payload` and run every enabled command concurrently.
    ///
    /// Fails only with `InvalidCommandFormat`; individual tool failures
    /// degrade to a `None` entry. Dropping the returned future aborts all
    /// in-flight tool requests.
    pub async fn dispatch(&self, payload: &str, plugins: &BTreeMap<String, bool>) -> Result<ToolOutput> {
        let commands = parse_commands(payload)?;
        let enabled: Vec<Command> = commands
            .into_iter()
            .filter(|c| match c.action.plugin_key() {
                Some(key) => plugins.get(key).copied().unwrap_or(false),
                // Unknown actions still produce a None entry.
                None => true,
            })
            .collect();
        if enabled.is_empty() {
            return Ok(ToolOutput::none());
        }

        let futures: Vec<_> = enabled
            .iter()
            .map(|cmd| {
                let span = tracing::info_span!("tool.call", action = cmd.action.kind(), arg = %cmd.arg);
                self.run_one(cmd).instrument(span)
            })
            .collect();
        let outcomes = futures_util::future::join_all(futures).await;

        Ok(assemble(outcomes))
    }

    async fn run_one(&self, cmd: &Command) -> Outcome {
        let outcome = match &cmd.action {
            Action::Search => self
                .backend
                .search(&cmd.arg, self.search_topk)
                .await
                .map(|hits| Outcome::Search { query: cmd.arg.clone(), hits }),
            Action::Calculate => self.backend.calculate(&cmd.arg).await.and_then(|r| {
                let r = r.trim().to_string();
                r.parse::<f64>()
                    .map(|_| Outcome::Text { action: Action::Calculate, request: cmd.arg.clone(), result: r.clone() })
                    .map_err(|_| mc_domain::error::Error::Internal(format!("non-numeric result {r:?}")))
            }),
            Action::Solve => self.backend.solve(&cmd.arg).await.map(|r| {
                if r.contains("[ERROR]") {
                    Outcome::Failed
                } else {
                    Outcome::Text { action: Action::Solve, request: cmd.arg.clone(), result: r.trim().to_string() }
                }
            }),
            Action::Draw => self
                .backend
                .draw(&cmd.arg)
                .await
                .map(|image| Outcome::Draw { prompt: cmd.arg.clone(), image }),
            Action::Unknown(name) => {
                tracing::warn!(action = %name, "unknown tool action");
                Ok(Outcome::Failed)
            }
        };
        outcome.unwrap_or_else(|e| {
            TraceEvent::ToolFailed {
                action: cmd.action.kind().to_string(),
                error: e.to_string(),
            }
            .emit();
            Outcome::Failed
        })
    }
}

/// Join outcomes in input order. Search hits are numbered here, after the
/// join, so tags are stable regardless of which request finished first.
fn assemble(outcomes: Vec<Outcome>) -> ToolOutput {
    let mut counter = 0u32;
    let mut results = Vec::with_capacity(outcomes.len());
    let mut out = ToolOutput::default();

    for outcome in outcomes {
        match outcome {
            Outcome::Search { query, hits } if !hits.is_empty() => {
                let mut lines = Vec::with_capacity(hits.len());
                let mut numbered = Vec::with_capacity(hits.len());
                for hit in &hits {
                    counter += 1;
                    lines.push(format!("<|{counter}|>: \"{}\"", hit.summary.trim()));
                    numbered.push(json!({
                        "id": counter,
                        "title": hit.title,
                        "url": hit.url,
                        "summary": hit.summary,
                    }));
                }
                results.push(lines.join("\n"));
                out.extra_data.push(ExtraData::new("search", &query, json!(hits)));
                out.processed_extra_data
                    .push(json!({"type": "search", "request": query, "data": numbered}));
            }
            Outcome::Search { .. } | Outcome::Failed => results.push(NONE_RESULT.to_string()),
            Outcome::Text { action, request, result } => {
                let extra = ExtraData::new(action.kind(), &request, json!(result));
                out.processed_extra_data.push(json!(extra));
                out.extra_data.push(extra);
                results.push(result);
            }
            Outcome::Draw { prompt, image } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&image);
                out.extra_data.push(ExtraData::new("draw", &prompt, json!(encoded)));
                out.processed_extra_data
                    .push(json!({"type": "draw", "request": prompt, "data": {"bytes": image.len()}}));
                results.push(DRAW_RESULT.to_string());
            }
        }
    }

    out.result = if results.is_empty() {
        NONE_RESULT.to_string()
    } else {
        results.join("\n")
    };
    out
}
