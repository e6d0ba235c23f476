//! Queue-monitor wake-ups.
//!
//! Adding due work signals the queue's consumers instead of leaving them to
//! their periodic sweep. Signals for one queue are throttled through the
//! injected cache, so a burst of inserts produces at most one wake-up per
//! interval.

use tokio::sync::broadcast;

use crate::cache::TtlCache;

#[derive(Clone)]
pub struct QueueMonitor {
    throttle: TtlCache<String, ()>,
    wake: broadcast::Sender<String>,
}

impl QueueMonitor {
    /// `throttle`'s TTL is the minimum spacing between wake-ups per queue.
    pub fn new(throttle: TtlCache<String, ()>) -> Self {
        let (wake, _) = broadcast::channel(256);
        Self { throttle, wake }
    }

    /// Receive the id of every queue that was signalled.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.wake.subscribe()
    }

    /// Signal that `queue_id` has due work. Returns whether a wake-up was
    /// actually sent.
    pub fn notify(&self, queue_id: &str) -> bool {
        if !self.throttle.insert_if_vacant(queue_id.to_string(), ()) {
            tracing::trace!(wiqid = queue_id, "queue wake-up throttled");
            return false;
        }
        // No subscribers is fine: nobody is waiting.
        let _ = self.wake.send(queue_id.to_string());
        tracing::debug!(wiqid = queue_id, "queue wake-up");
        true
    }

    /// Forget the throttle state for a queue, e.g. after it was deleted.
    pub fn forget(&self, queue_id: &str) {
        self.throttle.invalidate(&queue_id.to_string());
    }
}
