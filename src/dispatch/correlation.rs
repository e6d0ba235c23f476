//! Outstanding requests awaiting a reply, keyed by request or correlation id.
//!
//! Every entry has a bounded lifetime: it is removed when the reply arrives,
//! when the waiter times out, or when the waiting handle is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use super::Envelope;
use crate::error::{Error, Result};

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Envelope>,
}

#[derive(Clone, Default)]
pub struct PendingReplies {
    waiting: Arc<DashMap<String, Waiter>>,
    tickets: Arc<AtomicU64>,
}

/// Handle for one outstanding request. Dropping it forgets the request.
pub struct PendingReply {
    key: String,
    ticket: u64,
    rx: oneshot::Receiver<Envelope>,
    table: PendingReplies,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on `key`. Refused while another request holds it.
    pub fn register(&self, key: impl Into<String>) -> Result<PendingReply> {
        let key = key.into();
        match self.waiting.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::Validation(format!(
                "request {key} is already awaiting a reply"
            ))),
            Entry::Vacant(slot) => {
                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert(Waiter { ticket, tx });
                Ok(PendingReply {
                    key,
                    ticket,
                    rx,
                    table: self.clone(),
                })
            }
        }
    }

    /// Hand `reply` to whoever waits on `key`. False when nobody does.
    pub fn complete(&self, key: &str, reply: Envelope) -> bool {
        match self.waiting.remove(key) {
            Some((_, waiter)) => waiter.tx.send(reply).is_ok(),
            None => {
                tracing::debug!(key, "reply for unknown or expired request");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

impl PendingReply {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Other(format!("reply channel for {} closed", self.key))),
            Err(_) => {
                tracing::warn!(key = %self.key, ?timeout, "timed out waiting for reply");
                Err(Error::Timeout(self.key.clone()))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.table
            .waiting
            .remove_if(&self.key, |_, waiter| waiter.ticket == ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reply_resolves_waiter() {
        let table = PendingReplies::new();
        let pending = table.register("c1").unwrap();
        assert!(table.complete("c1", Envelope::request("pong", json!({}))));
        let reply = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.command, "pong");
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let table = PendingReplies::new();
        let pending = table.register("c2").unwrap();
        assert_eq!(table.len(), 1);
        let err = pending.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(table.is_empty());
        assert!(!table.complete("c2", Envelope::default()));
    }

    #[test]
    fn duplicate_keys_are_refused() {
        let table = PendingReplies::new();
        let _first = table.register("dup").unwrap();
        assert!(matches!(table.register("dup"), Err(Error::Validation(_))));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_releases_entry() {
        let table = PendingReplies::new();
        let pending = table.register("c3").unwrap();
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), pending.wait(Duration::from_secs(5))).await;
        assert!(cancelled.is_err());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(table.is_empty());

        // The key is free for a new request.
        let again = table.register("c3").unwrap();
        drop(again);
        assert!(table.is_empty());
    }
}
