//! Turn orchestrator.
//!
//! A MOSS turn runs two upstream stages. Stage 1 produces Inner Thoughts
//! and a command list; the commands are dispatched to the tool services and
//! their results are fed into stage 2, whose answer is streamed to the
//! client through the sensitive filter. OpenAI-style models run a single
//! streamed completion instead. Either way the finished record is persisted
//! before the end-of-turn frame goes out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::Instrument;

use mc_domain::config::{InferenceConfig, SensitiveConfig};
use mc_domain::error::{Error, Result};
use mc_domain::frame::{ServerFrame, STAGE_INNER_THOUGHTS, STAGE_MOSS};
use mc_domain::model::{ApiType, ModelConfig, Record, User};
use mc_domain::trace::TraceEvent;
use mc_providers::{BackendResolver, ChatStreamRequest, MossBackend, MossResponse, SensitiveChecker};
use mc_sessions::{ChatStore, OffenseAccounting};
use mc_tools::{ToolDispatcher, ToolOutput, NONE_RESULT};

use super::callbacks::CallbackRegistry;
use super::cancel::CancelObserver;
use super::filter::{HitAccounting, SensitiveFilter};
use super::format::{parse_stage1, parse_stage2};
use super::limiter::InferLimiter;
use super::listener::StreamListener;
use super::openai_stream::stream_chat;
use super::prompt::{merge_plugins, moss_request, openai_messages, TurnPrompt, TAG_INNER_THOUGHTS, TAG_MOSS, TAG_RESULTS};
use super::FrameSender;

/// Everything a turn needs from the session.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub user: User,
    pub chat_id: i64,
    pub model: ModelConfig,
    pub request: String,
    /// Client sampling overrides.
    pub params: HashMap<String, f64>,
}

pub struct Orchestrator {
    pub store: Arc<ChatStore>,
    pub backends: Arc<dyn BackendResolver>,
    pub callbacks: Arc<CallbackRegistry>,
    pub tools: Arc<ToolDispatcher>,
    pub checker: Arc<dyn SensitiveChecker>,
    pub offense: Arc<OffenseAccounting>,
    pub limiter: Arc<InferLimiter>,
    pub inference: InferenceConfig,
    pub sensitive: SensitiveConfig,
}

/// One MOSS stage.
struct Stage<'a> {
    label: &'static str,
    prompt: String,
    grace: Duration,
    filter: Option<&'a mut SensitiveFilter>,
}

impl Orchestrator {
    /// Run one turn to completion and return the persisted record.
    ///
    /// `Error::Sensitive` means the refusal frame was already sent and the
    /// flagged record persisted. `Error::Interrupt` means nothing was
    /// persisted.
    pub async fn run_turn(&self, input: TurnInput, frames: FrameSender, cancel: CancelObserver) -> Result<Record> {
        let span = tracing::info_span!(
            "turn",
            chat_id = input.chat_id,
            user_id = input.user.id,
            model_id = input.model.id,
            api_type = ?input.model.api_type,
            "otel.kind" = "SERVER",
        );
        async move {
            let started = Instant::now();
            let outcome = match input.model.api_type {
                ApiType::Moss => self.run_moss(&input, &frames, &cancel, started).await,
                ApiType::Openai => self.run_openai(&input, &frames, &cancel, started).await,
            };
            match &outcome {
                Ok(record) => TraceEvent::TurnFinished {
                    chat_id: record.chat_id,
                    record_id: record.id,
                    duration_secs: record.duration,
                }
                .emit(),
                Err(Error::Interrupt) => tracing::info!("turn interrupted by client"),
                Err(Error::Sensitive) => tracing::info!("turn ended by sensitive filter"),
                Err(e) => tracing::warn!(error = %e, "turn failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn filter(&self, input: &TurnInput, frames: &FrameSender) -> SensitiveFilter {
        SensitiveFilter::new(self.checker.clone(), &self.sensitive, frames.clone())
            .check_enabled(input.model.enable_sensitive_check && !input.user.disable_sensitive_check)
            .end_delimiter(&input.model.end_delimiter)
            .with_accounting(HitAccounting {
                offense: self.offense.clone(),
                user_id: input.user.id,
                chat_id: input.chat_id,
            })
    }

    // ── MOSS ────────────────────────────────────────────────────────

    async fn run_moss(
        &self,
        input: &TurnInput,
        frames: &FrameSender,
        cancel: &CancelObserver,
        started: Instant,
    ) -> Result<Record> {
        let backend = self.backends.moss(&input.model)?;
        let prefix = self
            .store
            .last_record(input.chat_id)
            .map(|r| r.prefix)
            .unwrap_or_default();
        let prompt = TurnPrompt::new(&prefix, &input.request);
        let plugins = merge_plugins(&input.model.default_plugin_config, &input.user.plugin_config);
        let params = self.inference.sampling_with(input.params.iter());
        let mut record = Record::new(input.chat_id, input.request.clone(), input.model.id);

        let stage1 = Stage {
            label: STAGE_INNER_THOUGHTS,
            prompt: prompt.stage1(),
            grace: Duration::ZERO,
            filter: None,
        };
        let generation = self
            .run_stage(backend.as_ref(), input, &plugins, &params, stage1, cancel)
            .await?;
        let mut stage1 = parse_stage1(&format!("{TAG_INNER_THOUGHTS}{generation}"))?;
        if cancel.is_cancelled() {
            return Err(Error::Interrupt);
        }

        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Interrupt),
            out = self.tools.dispatch(&stage1.commands, &plugins) => out,
        };
        let tools = match dispatched {
            Ok(out) => out,
            Err(Error::InvalidCommandFormat(reason)) => {
                tracing::warn!(%reason, commands = %stage1.commands, "unparseable command list");
                if input.model.inner_thoughts_postprocess {
                    stage1.inner_thoughts = NONE_RESULT.into();
                }
                ToolOutput::none()
            }
            Err(e) => return Err(e),
        };
        if cancel.is_cancelled() {
            return Err(Error::Interrupt);
        }

        let stage1_text = stage1.render();
        let mut filter = self.filter(input, frames);
        let stage2 = Stage {
            label: STAGE_MOSS,
            prompt: prompt.stage2(&stage1_text, &tools.result),
            grace: Duration::from_millis(self.inference.post_stream_grace_ms),
            filter: Some(&mut filter),
        };
        let outcome = self
            .run_stage(backend.as_ref(), input, &plugins, &params, stage2, cancel)
            .await;
        let generation = match outcome {
            Ok(g) => g,
            Err(Error::Sensitive) => {
                self.record_flagged(record, &filter, &prefix, started).await;
                return Err(Error::Sensitive);
            }
            Err(e) => return Err(e),
        };
        let stage2 = parse_stage2(&format!("{TAG_MOSS}{generation}"))?;
        let answer = filter.truncate(&stage2.answer).0.to_string();
        match filter.finish(&answer).await {
            Ok(()) => {}
            Err(Error::Sensitive) => {
                self.record_flagged(record, &filter, &prefix, started).await;
                return Err(Error::Sensitive);
            }
            Err(e) => return Err(e),
        }

        let raw_content = format!(
            "{stage1_text}\n{TAG_RESULTS} {}<eor>\n{}",
            tools.result,
            stage2.render()
        );
        record.prefix = format!("{}{raw_content}\n", prompt.head());
        record.raw_content = raw_content;
        record.response = answer;
        record.inner_thoughts = stage1.inner_thoughts;
        record.extra_data = tools
            .extra_data
            .iter()
            .map(serde_json::to_value)
            .collect::<serde_json::Result<Vec<_>>>()?;
        record.processed_extra_data = tools.processed_extra_data;
        record.duration = started.elapsed().as_secs_f64();

        // An interrupted turn leaves nothing behind.
        if cancel.is_cancelled() {
            return Err(Error::Interrupt);
        }
        let record = self.store.persist_turn(record, self.inference.chat_name_chars).await?;
        frames.frame(ServerFrame::end()).await?;
        Ok(record)
    }

    /// POST one stage while its listener drains the callback slot. Returns
    /// the stage's `new_generations` once both are finished.
    async fn run_stage(
        &self,
        backend: &dyn MossBackend,
        input: &TurnInput,
        plugins: &BTreeMap<String, bool>,
        params: &BTreeMap<String, f64>,
        stage: Stage<'_>,
        cancel: &CancelObserver,
    ) -> Result<String> {
        let Stage {
            label,
            prompt,
            grace,
            filter,
        } = stage;
        let slot = self.callbacks.register();
        let uuid = slot.uuid();
        let req = moss_request(&input.model, prompt, uuid, input.chat_id, plugins, params);
        let span = tracing::info_span!("moss.stage", stage = label, uuid = %uuid, model_id = input.model.id);

        async move {
            let started = Instant::now();
            let idle = Duration::from_secs(self.inference.callback_idle_timeout_secs);
            let (done_tx, done_rx) = oneshot::channel();
            let mut done_tx = Some(done_tx);

            let listen = StreamListener::new(slot, idle, grace, cancel.clone()).listen(filter, done_rx);
            let post = backend.infer(&req);
            tokio::pin!(listen);
            tokio::pin!(post);

            let mut response: Option<MossResponse> = None;
            let mut listened = false;
            let outcome = loop {
                if listened {
                    if let Some(resp) = response.take() {
                        break Ok(resp);
                    }
                }
                tokio::select! {
                    res = &mut post, if response.is_none() => match res {
                        Ok(resp) => {
                            response = Some(resp);
                            if let Some(tx) = done_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                        Err(e) => break Err(e),
                    },
                    res = &mut listen, if !listened => match res {
                        Ok(()) => listened = true,
                        Err(e) => break Err(e),
                    },
                    _ = cancel.cancelled(), if listened => break Err(Error::Interrupt),
                }
            };

            let status = match &outcome {
                Ok(_) => 200,
                Err(e) => e.status_code(),
            };
            match &outcome {
                Err(Error::Interrupt) | Err(Error::Sensitive) => {}
                other => self.limiter.add_stats(other.is_ok()),
            }
            TraceEvent::UpstreamCall {
                model_id: input.model.id,
                stage: label.into(),
                status,
                duration_ms: started.elapsed().as_millis() as u64,
            }
            .emit();
            outcome.map(|resp| resp.new_generations)
        }
        .instrument(span)
        .await
    }

    // ── OpenAI-style ────────────────────────────────────────────────

    async fn run_openai(
        &self,
        input: &TurnInput,
        frames: &FrameSender,
        cancel: &CancelObserver,
        started: Instant,
    ) -> Result<Record> {
        if !self.limiter.allow() {
            return Err(Error::Unknown("inference temporarily unavailable".into()));
        }
        let streamer = self.backends.streamer(&input.model)?;
        let history = self.store.records(input.chat_id);
        let req = ChatStreamRequest {
            messages: openai_messages(&input.model, &history, &input.request),
            stop: vec![input.model.end_delimiter.clone()],
            params: self.inference.sampling_with(input.params.iter()),
            model: None,
        };
        let mut filter = self.filter(input, frames);
        let record = Record::new(input.chat_id, input.request.clone(), input.model.id);

        let outcome = stream_chat(streamer.as_ref(), &req, &mut filter, cancel).await;
        match &outcome {
            Err(Error::Interrupt) | Err(Error::Sensitive) => {}
            other => self.limiter.add_stats(other.is_ok()),
        }
        TraceEvent::UpstreamCall {
            model_id: input.model.id,
            stage: STAGE_MOSS.into(),
            status: outcome.as_ref().map(|_| 200).unwrap_or_else(|e| e.status_code()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();

        let answer = match outcome {
            Ok(answer) => answer,
            Err(Error::Sensitive) => {
                self.record_flagged(record, &filter, "", started).await;
                return Err(Error::Sensitive);
            }
            Err(e) => return Err(e),
        };

        let mut record = record;
        record.response = answer.clone();
        record.raw_content = answer.clone();
        record.duration = started.elapsed().as_secs_f64();
        if cancel.is_cancelled() {
            return Err(Error::Interrupt);
        }
        let record = self.store.persist_turn(record, self.inference.chat_name_chars).await?;
        frames.frame(ServerFrame::end_with(answer)).await?;
        Ok(record)
    }

    /// Persist a turn whose response was flagged. The refusal frame is
    /// already out, so a storage failure is only logged.
    async fn record_flagged(&self, mut record: Record, filter: &SensitiveFilter, prefix: &str, started: Instant) {
        record.response_sensitive = true;
        record.response = filter.flagged().unwrap_or_default().to_string();
        record.prefix = prefix.to_string();
        record.duration = started.elapsed().as_secs_f64();
        match self.store.persist_turn(record, self.inference.chat_name_chars).await {
            Ok(r) => tracing::info!(chat_id = r.chat_id, record_id = r.id, "flagged response recorded"),
            Err(e) => tracing::error!(error = %e, "failed to persist flagged record"),
        }
    }
}
