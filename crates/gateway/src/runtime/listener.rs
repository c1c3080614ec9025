//! Stream listener for one MOSS stage.
//!
//! Drains the stage's callback slot while the upstream POST is in flight.
//! The idle timer restarts on every frame, heartbeats included. Once the
//! POST has returned the listener only keeps draining for the grace period.

use std::time::Duration;

use tokio::sync::oneshot;

use mc_domain::error::{Error, Result};
use mc_domain::frame::{CallbackFrame, STAGE_MOSS, STATUS_END, STATUS_ERROR, STATUS_HEARTBEAT, STATUS_PARTIAL};

use super::callbacks::CallbackSlot;
use super::cancel::CancelObserver;
use super::filter::SensitiveFilter;

pub struct StreamListener {
    slot: CallbackSlot,
    idle: Duration,
    grace: Duration,
    cancel: CancelObserver,
}

/// What to do after one frame.
enum Step {
    Continue,
    Finished,
}

impl StreamListener {
    pub fn new(slot: CallbackSlot, idle: Duration, grace: Duration, cancel: CancelObserver) -> Self {
        Self {
            slot,
            idle,
            grace,
            cancel,
        }
    }

    /// Run until the backend ends the stream, the grace period after `done`
    /// lapses, or the connection closes. Answer frames go to `filter`; with
    /// no filter the stage's partial output is not shown to the client.
    pub async fn listen(
        mut self,
        mut filter: Option<&mut SensitiveFilter>,
        mut done: oneshot::Receiver<()>,
    ) -> Result<()> {
        let uuid = self.slot.uuid();
        let mut upstream_done = false;

        loop {
            let wait = if upstream_done { self.grace } else { self.idle };
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.slot.close();
                    return Err(Error::Interrupt);
                }

                next = tokio::time::timeout(wait, self.slot.recv()) => match next {
                    Ok(Some(frame)) => {
                        if self.cancel.is_cancelled() {
                            self.slot.close();
                            return Err(Error::Interrupt);
                        }
                        match handle(frame, filter.as_deref_mut()).await? {
                            Step::Continue => {}
                            Step::Finished => return Ok(()),
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(_) if upstream_done => {
                        tracing::debug!(uuid = %uuid, "callback stream drained");
                        return Ok(());
                    }
                    Err(_) => {
                        self.slot.close();
                        tracing::warn!(uuid = %uuid, idle_secs = self.idle.as_secs(), "callback channel idle");
                        return Err(Error::Timeout("callback channel idle".into()));
                    }
                },

                _ = &mut done, if !upstream_done => {
                    upstream_done = true;
                }
            }
        }
    }
}

async fn handle(frame: CallbackFrame, filter: Option<&mut SensitiveFilter>) -> Result<Step> {
    match frame.status {
        STATUS_PARTIAL => {
            if frame.stage != STAGE_MOSS {
                return Ok(Step::Continue);
            }
            if let Some(filter) = filter {
                filter.feed(&frame.output).await?;
                if filter.terminated() {
                    return Ok(Step::Finished);
                }
            }
            Ok(Step::Continue)
        }
        STATUS_END => Ok(Step::Finished),
        STATUS_ERROR => Err(Error::Internal(format!("backend stream error: {}", frame.output))),
        STATUS_HEARTBEAT => Ok(Step::Continue),
        other => {
            tracing::debug!(status = other, "ignoring callback frame with unknown status");
            Ok(Step::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mc_domain::config::SensitiveConfig;
    use mc_domain::frame::STAGE_INNER_THOUGHTS;
    use mc_providers::sensitive::NoopChecker;

    use crate::runtime::callbacks::CallbackRegistry;
    use crate::runtime::cancel::ConnectionGuard;
    use crate::runtime::FrameSender;

    const IDLE: Duration = Duration::from_millis(200);

    fn setup() -> (Arc<CallbackRegistry>, CallbackSlot, ConnectionGuard) {
        let registry = Arc::new(CallbackRegistry::new(16));
        let slot = registry.register();
        (registry, slot, ConnectionGuard::new())
    }

    #[tokio::test]
    async fn answer_frames_reach_the_filter_until_end() {
        let (registry, slot, guard) = setup();
        let uuid = slot.uuid();
        let (frames, mut rx) = FrameSender::channel(16);
        let mut filter = SensitiveFilter::new(Arc::new(NoopChecker), &SensitiveConfig::default(), frames);

        registry.deliver(&uuid, CallbackFrame::new(1, "thinking", STAGE_INNER_THOUGHTS)).await.unwrap();
        registry.deliver(&uuid, CallbackFrame::new(2, "", "")).await.unwrap();
        registry.deliver(&uuid, CallbackFrame::new(1, "Hi there!", STAGE_MOSS)).await.unwrap();
        registry.deliver(&uuid, CallbackFrame::new(0, "", STAGE_MOSS)).await.unwrap();

        let (_done_tx, done_rx) = oneshot::channel();
        StreamListener::new(slot, IDLE, Duration::ZERO, guard.observer())
            .listen(Some(&mut filter), done_rx)
            .await
            .unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.as_frame().unwrap().output.as_deref(), Some("Hi there!"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_frame_fails_the_stage() {
        let (registry, slot, guard) = setup();
        registry
            .deliver(&slot.uuid(), CallbackFrame::new(-1, "CUDA out of memory", STAGE_MOSS))
            .await
            .unwrap();
        let (_done_tx, done_rx) = oneshot::channel();
        let err = StreamListener::new(slot, IDLE, Duration::ZERO, guard.observer())
            .listen(None, done_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(m) if m.contains("CUDA")));
    }

    #[tokio::test]
    async fn silence_before_the_post_returns_times_out() {
        let (registry, slot, guard) = setup();
        let uuid = slot.uuid();
        let (_done_tx, done_rx) = oneshot::channel();
        let err = StreamListener::new(slot, Duration::from_millis(30), Duration::ZERO, guard.observer())
            .listen(None, done_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!registry.contains(&uuid));
    }

    #[tokio::test]
    async fn finished_post_drains_buffered_frames_then_returns() {
        let (registry, slot, guard) = setup();
        let uuid = slot.uuid();
        let (frames, mut rx) = FrameSender::channel(16);
        let mut filter = SensitiveFilter::new(Arc::new(NoopChecker), &SensitiveConfig::default(), frames);
        registry.deliver(&uuid, CallbackFrame::new(1, "Buffered.", STAGE_MOSS)).await.unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        done_tx.send(()).unwrap();
        StreamListener::new(slot, IDLE, Duration::from_millis(20), guard.observer())
            .listen(Some(&mut filter), done_rx)
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().as_frame().unwrap().output.as_deref(), Some("Buffered."));
    }

    #[tokio::test]
    async fn closed_connection_interrupts() {
        let (_registry, slot, guard) = setup();
        let observer = guard.observer();
        guard.close();
        let (_done_tx, done_rx) = oneshot::channel();
        let err = StreamListener::new(slot, IDLE, Duration::ZERO, observer)
            .listen(None, done_rx)
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
    }
}
