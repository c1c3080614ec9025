//! Callback registry: correlation uuid → per-stage frame channel.
//!
//! A stage registers a slot right before its upstream POST; the uuid is
//! embedded in the callback URL the backend streams to. Frames pushed on
//! `/v1/callback/ws?uuid=…` are routed here by [`CallbackRegistry::deliver`].
//! The slot is removed when the owning [`CallbackSlot`] is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use mc_domain::frame::CallbackFrame;
use mc_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Entry {
    tx: mpsc::Sender<CallbackFrame>,
    closed: Arc<AtomicBool>,
}

/// Why a callback frame could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverError {
    /// No slot is registered under the uuid.
    Unknown,
    /// The slot timed out or its connection went away.
    Closed,
}

impl DeliverError {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliverError::Unknown => "unknown_uuid",
            DeliverError::Closed => "closed",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CallbackRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CallbackRegistry {
    slots: DashMap<Uuid, Entry>,
    /// Bounded buffer per slot.
    buffer: usize,
}

impl CallbackRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            slots: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a fresh slot under a random uuid.
    pub fn register(self: &Arc<Self>) -> CallbackSlot {
        let uuid = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        let closed = Arc::new(AtomicBool::new(false));
        self.slots.insert(
            uuid,
            Entry {
                tx,
                closed: closed.clone(),
            },
        );
        tracing::debug!(uuid = %uuid, "callback slot registered");
        CallbackSlot {
            uuid,
            rx,
            closed,
            registry: self.clone(),
        }
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.slots.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Route one frame to its slot. Waits while the slot's buffer is full.
    pub async fn deliver(&self, uuid: &Uuid, frame: CallbackFrame) -> Result<(), DeliverError> {
        // Clone the sender out so no map guard is held across the await.
        let (tx, closed) = match self.slots.get(uuid) {
            Some(entry) => (entry.tx.clone(), entry.closed.clone()),
            None => return Err(self.dropped(uuid, DeliverError::Unknown)),
        };
        if closed.load(Ordering::Acquire) {
            return Err(self.dropped(uuid, DeliverError::Closed));
        }
        tx.send(frame)
            .await
            .map_err(|_| self.dropped(uuid, DeliverError::Closed))
    }

    fn dropped(&self, uuid: &Uuid, err: DeliverError) -> DeliverError {
        TraceEvent::CallbackDropped {
            uuid: uuid.to_string(),
            reason: err.as_str().into(),
        }
        .emit();
        tracing::warn!(uuid = %uuid, reason = err.as_str(), "callback frame dropped");
        err
    }

    fn remove(&self, uuid: &Uuid) {
        if self.slots.remove(uuid).is_some() {
            tracing::debug!(uuid = %uuid, "callback slot removed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CallbackSlot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receiving end of one registered slot.
pub struct CallbackSlot {
    uuid: Uuid,
    rx: mpsc::Receiver<CallbackFrame>,
    closed: Arc<AtomicBool>,
    registry: Arc<CallbackRegistry>,
}

impl CallbackSlot {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn recv(&mut self) -> Option<CallbackFrame> {
        self.rx.recv().await
    }

    /// Refuse further frames; late callbacks are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        self.close();
        self.registry.remove(&self.uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_domain::frame::{STAGE_MOSS, STATUS_PARTIAL};

    fn frame(text: &str) -> CallbackFrame {
        CallbackFrame::new(STATUS_PARTIAL, text, STAGE_MOSS)
    }

    #[tokio::test]
    async fn frames_reach_the_registered_slot() {
        let registry = Arc::new(CallbackRegistry::new(8));
        let mut slot = registry.register();
        registry.deliver(&slot.uuid(), frame("hi")).await.unwrap();
        assert_eq!(slot.recv().await.unwrap().output, "hi");
    }

    #[tokio::test]
    async fn unknown_uuid_is_rejected() {
        let registry = Arc::new(CallbackRegistry::new(8));
        let err = registry.deliver(&Uuid::new_v4(), frame("x")).await.unwrap_err();
        assert_eq!(err, DeliverError::Unknown);
    }

    #[tokio::test]
    async fn closed_slot_drops_frames() {
        let registry = Arc::new(CallbackRegistry::new(8));
        let slot = registry.register();
        slot.close();
        let err = registry.deliver(&slot.uuid(), frame("late")).await.unwrap_err();
        assert_eq!(err, DeliverError::Closed);
    }

    #[tokio::test]
    async fn dropping_the_slot_unregisters_it() {
        let registry = Arc::new(CallbackRegistry::new(8));
        let slot = registry.register();
        let uuid = slot.uuid();
        assert!(registry.contains(&uuid));
        assert_eq!(registry.len(), 1);
        drop(slot);
        assert!(!registry.contains(&uuid));
        assert!(registry.is_empty());
    }
}
