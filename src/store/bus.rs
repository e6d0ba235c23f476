//! Message bus seam used by the namespace guard and command offload.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::error::{Error, Result};

/// Routing algorithm of an exchange. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeAlgorithm {
    Direct,
    Fanout,
    Topic,
    Header,
}

impl ExchangeAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeAlgorithm::Direct => "direct",
            ExchangeAlgorithm::Fanout => "fanout",
            ExchangeAlgorithm::Topic => "topic",
            ExchangeAlgorithm::Header => "header",
        }
    }

    /// Does a message published with `routing_key` reach a binding made
    /// with `binding_key`?
    pub fn routes(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            // Headers are not modelled; header exchanges deliver to every binding.
            ExchangeAlgorithm::Fanout | ExchangeAlgorithm::Header => true,
            ExchangeAlgorithm::Direct => binding_key == routing_key,
            ExchangeAlgorithm::Topic => topic_matches(binding_key, routing_key),
        }
    }
}

impl std::str::FromStr for ExchangeAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(ExchangeAlgorithm::Direct),
            "fanout" => Ok(ExchangeAlgorithm::Fanout),
            "topic" => Ok(ExchangeAlgorithm::Topic),
            "header" => Ok(ExchangeAlgorithm::Header),
            other => Err(Error::Validation(format!(
                "invalid algorithm {other}, must be direct, fanout, topic or header"
            ))),
        }
    }
}

/// AMQP-style topic match: `*` is one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

/// A message about to be published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Empty for direct-to-queue delivery.
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<Duration>,
    pub priority: u8,
}

impl OutboundMessage {
    pub fn to_queue(queue: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// A message taken off a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub queue: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: u8,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Delivery {
    pub fn from_message(queue: &str, msg: &OutboundMessage) -> Self {
        Self {
            queue: queue.to_string(),
            payload: msg.payload.clone(),
            correlation_id: msg.correlation_id.clone(),
            reply_to: msg.reply_to.clone(),
            priority: msg.priority,
            expires_at: msg
                .expiration
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn declare_exchange(&self, name: &str, algorithm: ExchangeAlgorithm) -> Result<()>;

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()>;

    async fn send(&self, msg: OutboundMessage) -> Result<()>;

    async fn send_with_reply_to(&self, mut msg: OutboundMessage, reply_to: &str) -> Result<()> {
        msg.reply_to = Some(reply_to.to_string());
        self.send(msg).await
    }

    /// Next unexpired message on `queue`, waiting up to `wait` for one.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;
}

// ---------------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BusState {
    queues: HashMap<String, VecDeque<Delivery>>,
    exchanges: HashMap<String, (ExchangeAlgorithm, Vec<(String, String)>)>,
}

/// Process-local bus. Higher priority messages are delivered first.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    async fn take(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        let pending = state.queues.get_mut(queue)?;
        pending.retain(|d| !d.is_expired());
        let best = pending
            .iter()
            .enumerate()
            .max_by_key(|(index, d)| (d.priority, std::cmp::Reverse(*index)))
            .map(|(index, _)| index)?;
        pending.remove(best)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, algorithm: ExchangeAlgorithm) -> Result<()> {
        self.state
            .lock()
            .await
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| (algorithm, Vec::new()));
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some((_, bindings)) = state.exchanges.get_mut(exchange) else {
            return Err(Error::NotFound(format!("exchange {exchange} not found")));
        };
        let binding = (queue.to_string(), routing_key.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let targets: Vec<String> = if msg.exchange.is_empty() {
                vec![msg.queue.clone()]
            } else {
                let Some((algorithm, bindings)) = state.exchanges.get(&msg.exchange) else {
                    return Err(Error::NotFound(format!("exchange {} not found", msg.exchange)));
                };
                bindings
                    .iter()
                    .filter(|(_, key)| algorithm.routes(key, &msg.routing_key))
                    .map(|(queue, _)| queue.clone())
                    .collect()
            };
            for queue in targets {
                let delivery = Delivery::from_message(&queue, &msg);
                state.queues.entry(queue).or_default().push_back(delivery);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.take(queue).await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}
