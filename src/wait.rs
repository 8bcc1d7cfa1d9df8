///
/// wait.rs
///
/// Strategies for turning a non-blocking receive poll into a bounded wait.
///
/// A transport whose driver owns a receive event exposes an [`EventWaiter`]
/// wired to it; every other transport falls back to [`PollWaiter`], which
/// naps in sub-millisecond quanta. The strategy is picked once when the
/// transport is constructed, not per call site.
///
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time;

#[async_trait]
pub trait Waitable: Send + Sync {
    /// Park until data may be available or `limit` elapses, whichever comes
    /// first. Spurious wakeups are allowed; callers re-poll after every
    /// return and check their own deadline.
    async fn wait(&self, limit: Duration);

    /// Wake a pending `wait`. No-op for polling strategies.
    fn signal(&self);
}

/// Driver-event-backed strategy.
pub struct EventWaiter {
    notify: Arc<Notify>,
}

impl EventWaiter {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

#[async_trait]
impl Waitable for EventWaiter {
    async fn wait(&self, limit: Duration) {
        let _ = time::timeout(limit, self.notify.notified()).await;
    }

    fn signal(&self) {
        self.notify.notify_one();
    }
}

/// Sleep quantum for the polling fallback. Short enough that a receive
/// deadline is never overshot by more than a millisecond.
pub const POLL_QUANTUM: Duration = Duration::from_millis(1);

/// Polling fallback for drivers without a wait primitive.
pub struct PollWaiter {
    quantum: Duration,
}

impl PollWaiter {
    pub fn new() -> Self {
        Self {
            quantum: POLL_QUANTUM,
        }
    }
}

impl Default for PollWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Waitable for PollWaiter {
    async fn wait(&self, limit: Duration) {
        time::sleep(limit.min(self.quantum)).await;
    }

    fn signal(&self) {}
}
