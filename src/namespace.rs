//! Queue namespace guard.
//!
//! Normalizes and authorizes broker queue and exchange names before they
//! are declared, so one tenant cannot bind to another's queue or to the
//! management channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::auth::AuthorizationGate;
use crate::cache::TtlCache;
use crate::config::NamespacePolicy;
use crate::error::{Error, Result};
use crate::model::{self, Identity, Right, collections, types, wellknown};
use crate::store::{DocumentStore, ExchangeAlgorithm, Filter, MessageBus, Query};

/// Collection holding agents, addressable by slug.
const AGENTS: &str = "agents";

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterQueueRequest {
    #[serde(default)]
    pub queuename: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterQueueResponse {
    pub queuename: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterExchangeRequest {
    #[serde(default)]
    pub exchangename: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
    #[serde(default)]
    pub routingkey: Option<String>,
    /// Declare and bind a private queue to the exchange. Defaults to true.
    #[serde(default)]
    pub addqueue: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterExchangeResponse {
    pub exchangename: String,
    pub queuename: String,
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct QueueNamespaceGuard {
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn MessageBus>,
    policy: NamespacePolicy,
    /// Backing entities by lookup key. Misses are not cached.
    entities: TtlCache<String, Value>,
}

/// Prefix derived from a username: `@` and `.` removed, lowercased.
pub fn tenant_prefix(identity: &Identity) -> String {
    identity
        .username
        .chars()
        .filter(|c| *c != '@' && *c != '.')
        .collect::<String>()
        .to_lowercase()
}

/// Prepend the tenant prefix, never producing something that looks like an id.
fn prefixed(identity: &Identity, name: &str) -> String {
    let mut full = format!("{}{name}", tenant_prefix(identity));
    if full.len() == 24 {
        full.push('1');
    }
    full
}

fn private_queue_name() -> String {
    format!("tmp.{}", model::new_id())
}

impl QueueNamespaceGuard {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn MessageBus>,
        policy: NamespacePolicy,
        entities: TtlCache<String, Value>,
    ) -> Self {
        Self {
            store,
            bus,
            policy,
            entities,
        }
    }

    fn required_right(&self) -> Right {
        if self.policy.consumer_has_update {
            Right::Update
        } else if self.policy.sender_has_invoke {
            Right::Invoke
        } else {
            Right::Read
        }
    }

    fn require_on(&self, identity: &Identity, entity: &Value, kind: &str, name: &str) -> Result<()> {
        let right = self.required_right();
        if AuthorizationGate::document_has_right(identity, entity, right) {
            return Ok(());
        }
        tracing::warn!(user = %identity.username, kind, name, %right, "namespace access denied");
        Err(Error::AccessDenied(format!(
            "[{}] Unknown {kind} {name} or access denied, missing {right} permission on {kind} object",
            identity.name
        )))
    }

    pub async fn register_queue(
        &self,
        identity: &Identity,
        req: RegisterQueueRequest,
    ) -> Result<RegisterQueueResponse> {
        let requested = req.queuename.unwrap_or_default().to_lowercase();
        if requested == wellknown::MANAGEMENT_CHANNEL {
            return Err(Error::AccessDenied("Access denied".into()));
        }
        if requested.is_empty() {
            let queuename = private_queue_name();
            self.bus.declare_queue(&queuename).await?;
            tracing::debug!(queue = %queuename, user = %identity.username, "registered private queue");
            return Ok(RegisterQueueResponse { queuename });
        }

        // Id-like names are authorized against their backing entity, never prefixed.
        let queuename = if self.policy.force_queue_prefix && !model::looks_like_id(&requested) {
            prefixed(identity, &requested)
        } else {
            requested
        };

        if self.policy.checks_backing_entity() {
            self.authorize_queue(identity, &queuename).await?;
        }

        self.bus.declare_queue(&queuename).await?;
        tracing::info!(queue = %queuename, user = %identity.username, "registered queue");
        Ok(RegisterQueueResponse { queuename })
    }

    async fn authorize_queue(&self, identity: &Identity, name: &str) -> Result<()> {
        if name == identity.id {
            return Ok(());
        }
        let strict = self.policy.consumer_has_update || self.policy.sender_has_invoke;
        if !strict && identity.has_role(name) {
            return Ok(());
        }

        if model::looks_like_id(name) {
            if let Some(principal) = self.lookup(collections::USERS, Filter::id(name)).await? {
                return self.require_on(identity, &principal, "queue", name);
            }
        }
        let by_name = Filter::eq("_type", types::QUEUE).and(Filter::eq("name", name));
        if let Some(queue) = self.lookup(collections::MQ, by_name).await? {
            return self.require_on(identity, &queue, "queue", name);
        }
        if let Some(agent) = self.lookup(AGENTS, Filter::eq("slug", name)).await? {
            return self.require_on(identity, &agent, "queue", name);
        }
        if model::looks_like_id(name) {
            if let Some(agent) = self.lookup(AGENTS, Filter::id(name)).await? {
                return self.require_on(identity, &agent, "queue", name);
            }
        }

        self.claim(identity, types::QUEUE, name).await
    }

    pub async fn register_exchange(
        &self,
        identity: &Identity,
        req: RegisterExchangeRequest,
    ) -> Result<RegisterExchangeResponse> {
        let requested = req.exchangename.unwrap_or_default().to_lowercase();
        if requested.is_empty() || requested == wellknown::MANAGEMENT_CHANNEL {
            return Err(Error::AccessDenied("Access denied".into()));
        }
        if !self.policy.enable_exchanges {
            return Err(Error::Validation("exchanges are not enabled".into()));
        }
        let algorithm: ExchangeAlgorithm = req
            .algorithm
            .as_deref()
            .ok_or_else(|| {
                Error::Validation(
                    "algorithm is mandatory, as either direct, fanout, topic or header".into(),
                )
            })?
            .parse()?;
        let routingkey = req.routingkey.unwrap_or_default();

        let exchangename = if self.policy.force_exchange_prefix {
            prefixed(identity, &requested)
        } else {
            requested
        };

        if self.policy.checks_backing_entity() {
            let by_name = Filter::eq("_type", types::EXCHANGE).and(Filter::eq("name", exchangename.as_str()));
            match self.lookup(collections::MQ, by_name).await? {
                Some(exchange) => self.require_on(identity, &exchange, "exchange", &exchangename)?,
                None => self.claim(identity, types::EXCHANGE, &exchangename).await?,
            }
        }

        self.bus.declare_exchange(&exchangename, algorithm).await?;
        let mut queuename = String::new();
        if req.addqueue.unwrap_or(true) {
            queuename = private_queue_name();
            self.bus.declare_queue(&queuename).await?;
            self.bus.bind_queue(&exchangename, &queuename, &routingkey).await?;
        }

        tracing::info!(
            exchange = %exchangename,
            algorithm = algorithm.as_str(),
            queue = %queuename,
            user = %identity.username,
            "registered exchange"
        );
        Ok(RegisterExchangeResponse {
            exchangename,
            queuename,
        })
    }

    /// Find a backing entity, consulting the cache first.
    async fn lookup(&self, collection: &str, filter: Filter) -> Result<Option<Value>> {
        let key = format!("{collection}:{filter:?}");
        if let Some(hit) = self.entities.get(&key) {
            return Ok(Some(hit));
        }
        let found = self
            .store
            .query(collection, &Query::new(filter).top(1), &Identity::root())
            .await?
            .into_iter()
            .next();
        if let Some(entity) = &found {
            self.entities.insert(key, entity.clone());
        }
        Ok(found)
    }

    /// Record a new backing entity owned by the caller.
    async fn claim(&self, identity: &Identity, entity_type: &str, name: &str) -> Result<()> {
        let doc = json!({ "_type": entity_type, "name": name, "_acl": [] });
        self.store.insert_one(collections::MQ, doc, identity).await?;
        self.entities.clear();
        tracing::info!(kind = entity_type, name, user = %identity.username, "claimed broker name");
        Ok(())
    }
}
