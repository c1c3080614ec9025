//! Inference runtime: the two-stage MOSS turn, the OpenAI-style streaming
//! path, and the per-connection session driver that runs them.
//!
//! Frames for the client flow through a [`FrameSender`]; the transport
//! (WebSocket or SSE) owns the receiving end.

pub mod callbacks;
pub mod cancel;
pub mod filter;
pub mod format;
pub mod limiter;
pub mod listener;
pub mod openai_stream;
pub mod orchestrator;
pub mod prompt;
pub mod session;
pub mod site_cache;

use tokio::sync::mpsc;

use mc_domain::error::{Error, Result};
use mc_domain::frame::ServerFrame;
use mc_domain::model::Record;

use cancel::CancelObserver;

/// One message written to a client connection, in order.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    /// The persisted record, sent after the end-of-turn frame.
    Record(Box<Record>),
}

impl Outbound {
    pub fn as_frame(&self) -> Option<&ServerFrame> {
        match self {
            Outbound::Frame(f) => Some(f),
            Outbound::Record(_) => None,
        }
    }
}

/// Sending half of a connection's outbound queue.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Outbound>,
    gate: Option<CancelObserver>,
}

impl FrameSender {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx, gate: None }, rx)
    }

    /// A sender that refuses frames once `cancel` fires, so nothing reaches
    /// the client after an interrupt.
    pub fn gated(&self, cancel: CancelObserver) -> Self {
        Self {
            tx: self.tx.clone(),
            gate: Some(cancel),
        }
    }

    /// Fails with [`Error::Interrupt`] once the transport has gone away.
    pub async fn frame(&self, frame: ServerFrame) -> Result<()> {
        if self.gate.as_ref().is_some_and(|g| g.is_cancelled()) {
            return Err(Error::Interrupt);
        }
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| Error::Interrupt)
    }

    pub async fn record(&self, record: Record) -> Result<()> {
        self.tx
            .send(Outbound::Record(Box::new(record)))
            .await
            .map_err(|_| Error::Interrupt)
    }
}
