//! Connection-scoped cancellation.
//!
//! The session driver owns a [`ConnectionGuard`] for the lifetime of the
//! client connection. Workers (listener, tool calls, upstream POSTs) only
//! hold a [`CancelObserver`], a weak handle that reports cancelled once the
//! guard is closed or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;

struct Flag {
    closed: AtomicBool,
    notify: Notify,
}

/// Owning side of the `connection-closed` flag.
pub struct ConnectionGuard {
    flag: Arc<Flag>,
}

impl ConnectionGuard {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(Flag {
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn observer(&self) -> CancelObserver {
        CancelObserver {
            flag: Arc::downgrade(&self.flag),
        }
    }

    /// Mark the connection closed and wake every waiting worker.
    pub fn close(&self) {
        self.flag.closed.store(true, Ordering::Release);
        self.flag.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.flag.closed.load(Ordering::Acquire)
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Non-owning view of a connection's cancellation state.
#[derive(Clone)]
pub struct CancelObserver {
    flag: Weak<Flag>,
}

impl CancelObserver {
    /// True once the guard was closed or dropped.
    pub fn is_cancelled(&self) -> bool {
        match self.flag.upgrade() {
            Some(flag) => flag.closed.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Resolves when the connection is closed.
    pub async fn cancelled(&self) {
        let Some(flag) = self.flag.upgrade() else {
            return;
        };
        // Registered before the check so a concurrent close is not missed.
        let notified = flag.notify.notified();
        if flag.closed.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn close_is_observed() {
        let guard = ConnectionGuard::new();
        let obs = guard.observer();
        assert!(!obs.is_cancelled());
        guard.close();
        assert!(obs.is_cancelled());
        assert!(guard.is_closed());
    }

    #[test]
    fn dropping_the_guard_cancels() {
        let guard = ConnectionGuard::new();
        let obs = guard.observer();
        drop(guard);
        assert!(obs.is_cancelled());
    }

    #[tokio::test]
    async fn waiters_wake_on_close() {
        let guard = ConnectionGuard::new();
        let obs = guard.observer();
        let waiter = tokio::spawn(async move { obs.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_closed() {
        let guard = ConnectionGuard::new();
        let obs = guard.observer();
        guard.close();
        tokio::time::timeout(Duration::from_millis(100), obs.cancelled())
            .await
            .unwrap();
    }
}
