//! Command dispatcher.
//!
//! Turns an inbound envelope into a reply: admission control, identity
//! resolution, command decoding, optional offload to a worker pool, and the
//! typed handler. Replies to our own outstanding requests are matched
//! against the connection's pending table and produce no reply.

pub mod command;
pub mod connection;
pub mod correlation;
pub mod documents;
pub mod envelope;
pub mod offload;
pub mod rate_limit;

pub use command::{Command, CommandKind};
pub use connection::Connection;
pub use correlation::PendingReplies;
pub use envelope::Envelope;
pub use offload::{OffloadClient, OffloadWorker};
pub use rate_limit::Admission;

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::Instrument;

use crate::auth::IdentityResolver;
use crate::cache::TtlCache;
use crate::config::Policy;
use crate::error::{Error, Result};
use crate::model::Identity;
use crate::namespace::QueueNamespaceGuard;
use crate::store::{BlobStore, DocumentStore, MemoryBlobStore, MemoryBus, MemoryDocumentStore, MessageBus};
use crate::telemetry::{metrics, spans};
use crate::workitem::{QueueMonitor, WorkitemEngine};
use command::SigninRequest;

/// The external collaborators every handler works through.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub bus: Arc<dyn MessageBus>,
}

impl Backends {
    /// Process-local backends for development and tests.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(MemoryDocumentStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            bus: Arc::new(MemoryBus::new()),
        }
    }
}

pub struct Dispatcher {
    engine: Arc<WorkitemEngine>,
    namespace: Arc<QueueNamespaceGuard>,
    store: Arc<dyn DocumentStore>,
    resolver: Arc<dyn IdentityResolver>,
    policy: Policy,
    offload: Option<Arc<OffloadClient>>,
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl Dispatcher {
    pub fn new(
        engine: Arc<WorkitemEngine>,
        namespace: Arc<QueueNamespaceGuard>,
        store: Arc<dyn DocumentStore>,
        resolver: Arc<dyn IdentityResolver>,
        policy: Policy,
    ) -> Self {
        Self {
            engine,
            namespace,
            store,
            resolver,
            policy,
            offload: None,
        }
    }

    /// Wire the engine and namespace guard over `backends`, each with its
    /// own cache.
    pub fn build(backends: &Backends, resolver: Arc<dyn IdentityResolver>, policy: Policy) -> Self {
        let monitor = QueueMonitor::new(TtlCache::new(policy.queue_monitor_interval()));
        let engine = WorkitemEngine::new(backends.store.clone(), backends.blobs.clone(), monitor);
        let namespace = QueueNamespaceGuard::new(
            backends.store.clone(),
            backends.bus.clone(),
            policy.namespace.clone(),
            TtlCache::new(std::time::Duration::from_secs(60)),
        );
        Self::new(
            Arc::new(engine),
            Arc::new(namespace),
            backends.store.clone(),
            resolver,
            policy,
        )
    }

    pub fn with_offload(mut self, client: Arc<OffloadClient>) -> Self {
        self.offload = Some(client);
        self
    }

    pub fn engine(&self) -> &WorkitemEngine {
        &self.engine
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Handle one inbound envelope. `None` when the envelope was a reply to
    /// one of our own requests.
    pub async fn process(&self, conn: &mut Connection, envelope: Envelope) -> Option<Envelope> {
        if envelope.is_reply() {
            let key = envelope.replyto.clone().unwrap_or_default();
            conn.pending().complete(&key, envelope);
            return None;
        }

        match conn.admit() {
            Admission::Allowed => {}
            Admission::Limited => {
                self.count_rate_limited(&envelope);
                return Some(envelope.error_reply(&Error::RateLimited));
            }
            Admission::Disconnect => {
                self.count_rate_limited(&envelope);
                conn.close();
                return Some(envelope.error_reply(&Error::RateLimited));
            }
        }

        Some(self.handle(conn, envelope, true).await)
    }

    /// Execute without admission control or offload. Used by offload
    /// workers, which run commands with the envelope's own credential.
    pub async fn process_local(&self, conn: &mut Connection, envelope: Envelope) -> Envelope {
        self.handle(conn, envelope, false).await
    }

    fn count_rate_limited(&self, envelope: &Envelope) {
        tracing::warn!(command = %envelope.command, "request rate limited");
        metrics::rate_limited().add(1, &[KeyValue::new("command", envelope.command.clone())]);
    }

    async fn handle(&self, conn: &mut Connection, envelope: Envelope, allow_offload: bool) -> Envelope {
        let started = Instant::now();
        let kind = CommandKind::from_name(&envelope.command);
        let span = spans::start_message_span(
            kind.map(CommandKind::span_name).unwrap_or("Unknown"),
            &envelope.id,
            envelope.trace_id.as_deref(),
            envelope.span_id.as_deref(),
        );
        span.record("clientid", conn.id.as_str());
        if let Some(agent) = &envelope.clientagent {
            span.record("clientagent", agent.as_str());
            conn.clientagent = Some(agent.clone());
        }
        if let Some(version) = &envelope.clientversion {
            span.record("clientversion", version.as_str());
            conn.clientversion = Some(version.clone());
        }

        let (reply, outcome) = self
            .run(conn, &envelope, kind, allow_offload)
            .instrument(span)
            .await;

        let command = kind.map(CommandKind::as_str).unwrap_or("unknown").to_string();
        metrics::commands().add(
            1,
            &[
                KeyValue::new("command", command.clone()),
                KeyValue::new("result", outcome),
            ],
        );
        metrics::command_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("command", command)],
        );
        reply
    }

    async fn run(
        &self,
        conn: &mut Connection,
        envelope: &Envelope,
        kind: Option<CommandKind>,
        allow_offload: bool,
    ) -> (Envelope, &'static str) {
        let Some(kind) = kind else {
            let err = Error::UnknownCommand(envelope.command.clone());
            tracing::warn!(command = %envelope.command, "unknown command");
            return (envelope.error_reply(&err), "unknown");
        };

        let identity = if kind.requires_identity() {
            match self.resolve(conn, envelope).await {
                Ok(identity) => {
                    tracing::Span::current().record("username", identity.username.as_str());
                    Some(identity)
                }
                Err(e) => {
                    tracing::info!(command = %kind, error = %e, "unauthenticated request");
                    return (envelope.error_reply(&e), "error");
                }
            }
        } else {
            None
        };

        if allow_offload && kind.offloadable() {
            if let Some(client) = &self.offload {
                let mut forwarded = envelope.clone();
                if forwarded.credential().is_none() {
                    forwarded.jwt = conn.credential().map(str::to_string);
                }
                return match client.forward(forwarded).await {
                    Ok(mut reply) => {
                        reply.id = crate::model::new_id();
                        reply.replyto = Some(envelope.id.clone());
                        reply.jwt = None;
                        (reply, "offloaded")
                    }
                    Err(e) => {
                        tracing::error!(command = %kind, error = %e, "offload failed");
                        (envelope.error_reply(&e), "error")
                    }
                };
            }
        }

        let result = match Command::parse(kind, envelope.payload()) {
            Ok(command) => self.execute(conn, identity.as_ref(), command, envelope).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(result) => {
                tracing::debug!(command = %kind, "command completed");
                (envelope.reply_with_result(result), "ok")
            }
            Err(e) => {
                tracing::warn!(command = %kind, error = %e, kind = e.kind(), "command failed");
                (envelope.error_reply(&e), "error")
            }
        }
    }

    /// Identity for a request: its own credential, else the connection's
    /// signed-in identity, else a fresh guest when guests are allowed.
    async fn resolve(&self, conn: &mut Connection, envelope: &Envelope) -> Result<Identity> {
        if let Some(credential) = envelope.credential() {
            return self
                .resolver
                .resolve(&credential)
                .await?
                .ok_or_else(|| Error::Unauthenticated("Failed resolving token".into()));
        }
        if let Some(identity) = conn.identity() {
            return Ok(identity.clone());
        }
        if self.policy.enable_guest {
            let guest = Identity::guest();
            let token = self.resolver.issue(&guest, self.policy.guest_token_ttl())?;
            conn.sign_in(guest.clone(), token);
            return Ok(guest);
        }
        Err(Error::Unauthenticated("Not signed in, and missing jwt".into()))
    }

    async fn execute(
        &self,
        conn: &mut Connection,
        identity: Option<&Identity>,
        command: Command,
        envelope: &Envelope,
    ) -> Result<Value> {
        let caller = || identity.ok_or_else(|| Error::Unauthenticated("Not signed in, and missing jwt".into()));
        let store = self.store.as_ref();

        match command {
            Command::Ping => Ok(json!("pong")),
            Command::Error => Ok(Value::Null),
            Command::Signin(req) => self.signin(conn, req, envelope).await,
            Command::RefreshToken => {
                let jwt = self.resolver.issue(caller()?, self.policy.token_ttl())?;
                Ok(json!({ "jwt": jwt }))
            }

            Command::Query(req) => documents::query(store, caller()?, req).await,
            Command::Count(req) => documents::count(store, caller()?, req).await,
            Command::InsertOne(req) => documents::insert_one(store, caller()?, req).await,
            Command::InsertMany(req) => documents::insert_many(store, caller()?, req).await,
            Command::UpdateOne(req) => documents::update_one(store, caller()?, req).await,
            Command::DeleteOne(req) => documents::delete_one(store, caller()?, req).await,
            Command::DeleteMany(req) => documents::delete_many(store, caller()?, req).await,

            Command::AddWorkitem(req) => to_value(self.engine.add_workitem(caller()?, req).await?),
            Command::AddWorkitems(req) => to_value(self.engine.add_workitems(caller()?, req).await?),
            Command::PopWorkitem(req) => to_value(self.engine.pop_workitem(caller()?, req).await?),
            Command::UpdateWorkitem(req) => to_value(self.engine.update_workitem(caller()?, req).await?),
            Command::DeleteWorkitem(req) => {
                self.engine.delete_workitem(caller()?, req).await?;
                Ok(Value::Null)
            }
            Command::AddWorkitemQueue(req) => {
                to_value(self.engine.add_workitem_queue(caller()?, req).await?)
            }
            Command::GetWorkitemQueue(req) => {
                to_value(self.engine.get_workitem_queue(caller()?, req).await?)
            }
            Command::UpdateWorkitemQueue(req) => {
                to_value(self.engine.update_workitem_queue(caller()?, req).await?)
            }
            Command::DeleteWorkitemQueue(req) => {
                self.engine.delete_workitem_queue(caller()?, req).await?;
                Ok(Value::Null)
            }

            Command::RegisterQueue(req) => to_value(self.namespace.register_queue(caller()?, req).await?),
            Command::RegisterExchange(req) => {
                to_value(self.namespace.register_exchange(caller()?, req).await?)
            }
        }
    }

    async fn signin(&self, conn: &mut Connection, req: SigninRequest, envelope: &Envelope) -> Result<Value> {
        let token = req
            .jwt
            .filter(|jwt| !jwt.is_empty())
            .or_else(|| envelope.jwt.clone())
            .ok_or_else(|| Error::mandatory("jwt"))?;
        let identity = self
            .resolver
            .resolve(&token)
            .await?
            .ok_or_else(|| Error::Unauthenticated("Failed resolving token".into()))?;

        let jwt = self.resolver.issue(&identity, self.policy.token_ttl())?;
        conn.sign_in(identity.clone(), jwt.clone());
        tracing::Span::current().record("username", identity.username.as_str());
        Ok(json!({ "user": identity, "jwt": jwt }))
    }
}
