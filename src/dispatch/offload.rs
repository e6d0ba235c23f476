//! Horizontal offload of commands to a worker pool over the message bus.
//!
//! The client forwards a request envelope to the shared worker queue and
//! waits for the reply on its own reply queue. The `correlationId` set on
//! the way out is the only thing that ties a reply to its caller, so
//! workers echo it back unchanged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::correlation::PendingReplies;
use super::{Connection, Dispatcher, Envelope};
use crate::config::OffloadPolicy;
use crate::error::Result;
use crate::model;
use crate::store::{Delivery, MessageBus, OutboundMessage};

const REPLY_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OffloadClient {
    bus: Arc<dyn MessageBus>,
    queue: String,
    reply_queue: String,
    pending: PendingReplies,
    reply_timeout: Duration,
    expiration: Duration,
    shutdown: Arc<Notify>,
}

impl OffloadClient {
    /// Declare the queues and start pumping replies.
    pub async fn start(bus: Arc<dyn MessageBus>, policy: &OffloadPolicy) -> Result<Arc<Self>> {
        let reply_queue = format!("{}.reply.{}", policy.queue, model::new_id());
        bus.declare_queue(&policy.queue).await?;
        bus.declare_queue(&reply_queue).await?;

        let client = Arc::new(Self {
            bus,
            queue: policy.queue.clone(),
            reply_queue,
            pending: PendingReplies::new(),
            reply_timeout: policy.reply_timeout(),
            expiration: policy.expiration(),
            shutdown: Arc::new(Notify::new()),
        });
        tokio::spawn(Arc::clone(&client).pump());
        info!(queue = %client.queue, reply_queue = %client.reply_queue, "offload client started");
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Send `envelope` to the worker pool and wait for its reply.
    ///
    /// The bus carries a correlation id minted per call; the caller's own
    /// correlation id is restored on the reply.
    pub async fn forward(&self, mut envelope: Envelope) -> Result<Envelope> {
        let caller_correlation = envelope.correlation_id.take();
        let key = model::new_id();
        envelope.correlation_id = Some(key.clone());

        let pending = self.pending.register(key.clone())?;
        let msg = OutboundMessage::to_queue(&self.queue, serde_json::to_value(&envelope)?)
            .correlation_id(&key)
            .expiration(self.expiration);
        self.bus.send_with_reply_to(msg, &self.reply_queue).await?;
        debug!(command = %envelope.command, correlation_id = %key, "offloaded command");

        let mut reply = pending.wait(self.reply_timeout).await?;
        reply.correlation_id = caller_correlation;
        Ok(reply)
    }

    async fn pump(self: Arc<Self>) {
        loop {
            let delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("offload reply pump shutting down");
                    return;
                }
                delivery = self.bus.receive(&self.reply_queue, REPLY_POLL) => delivery,
            };
            match delivery {
                Ok(Some(delivery)) => self.deliver(delivery),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "offload reply receive failed");
                    tokio::time::sleep(REPLY_POLL).await;
                }
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let reply: Envelope = match serde_json::from_value(delivery.payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "malformed offload reply");
                return;
            }
        };
        let key = delivery
            .correlation_id
            .or_else(|| reply.correlation_id.clone())
            .unwrap_or_default();
        self.pending.complete(&key, reply);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Consumes the offload queue and executes commands locally, replying to
/// each message's `reply_to` with the same correlation id.
pub struct OffloadWorker {
    dispatcher: Arc<Dispatcher>,
    bus: Arc<dyn MessageBus>,
    queue: String,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl Clone for OffloadWorker {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            bus: Arc::clone(&self.bus),
            queue: self.queue.clone(),
            poll_interval: self.poll_interval,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl OffloadWorker {
    pub fn new(dispatcher: Arc<Dispatcher>, bus: Arc<dyn MessageBus>, policy: &OffloadPolicy) -> Self {
        Self {
            dispatcher,
            bus,
            queue: policy.queue.clone(),
            poll_interval: Duration::from_secs(5),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.bus.declare_queue(&self.queue).await?;
        info!(queue = %self.queue, "offload worker started");

        loop {
            let delivery = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("offload worker shutting down");
                    return Ok(());
                }
                delivery = self.bus.receive(&self.queue, self.poll_interval) => delivery,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        error!("offload handle error: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("offload receive error: {e}, backing off");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) -> Result<()> {
        let envelope: Envelope = serde_json::from_value(delivery.payload)?;
        let mut conn = Connection::unlimited();
        let mut reply = self.dispatcher.process_local(&mut conn, envelope).await;
        if delivery.correlation_id.is_some() {
            reply.correlation_id = delivery.correlation_id.clone();
        }

        let Some(reply_to) = delivery.reply_to.filter(|r| !r.is_empty()) else {
            warn!(command = %reply.command, "offloaded command without reply_to, dropping reply");
            return Ok(());
        };
        let mut msg = OutboundMessage::to_queue(reply_to, serde_json::to_value(&reply)?);
        msg.correlation_id = reply.correlation_id.clone();
        self.bus.send(msg).await
    }
}
