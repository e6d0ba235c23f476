//! Persistence seams: documents, blobs and the message bus.
//!
//! The engine and dispatcher only talk to these traits. Every document
//! operation takes the caller's identity and the store applies ACL
//! filtering itself, so no code path issues an unfiltered read. In-memory
//! implementations live here; the Postgres ones live in [`crate::db`].

pub mod bus;
pub mod filter;
pub mod memory;

pub use bus::{Delivery, ExchangeAlgorithm, MemoryBus, MessageBus, OutboundMessage};
pub use filter::{Filter, Order, Query, Sort, SortKind};
pub use memory::{MemoryBlobStore, MemoryDocumentStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::model::acl::{add_right, normalize_acl};
use crate::model::{self, Identity, Right, Rights};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents in `collection` matching `query` that the caller may read.
    async fn query(&self, collection: &str, query: &Query, identity: &Identity)
    -> Result<Vec<Value>>;

    async fn count(&self, collection: &str, filter: &Filter, identity: &Identity) -> Result<u64>;

    async fn get_by_id(
        &self,
        collection: &str,
        id: &str,
        identity: &Identity,
    ) -> Result<Option<Value>> {
        let query = Query::new(Filter::id(id)).top(1);
        Ok(self.query(collection, &query, identity).await?.into_iter().next())
    }

    async fn insert_one(&self, collection: &str, doc: Value, identity: &Identity) -> Result<Value>;

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        identity: &Identity,
    ) -> Result<Vec<Value>>;

    /// Replace the single document matched by `matching` with `doc`,
    /// provided the caller holds update on the stored version. Returns the
    /// number of documents replaced (0 or 1). This is the conditional
    /// update the claim loop relies on: it either applies atomically or
    /// not at all.
    async fn update_one(
        &self,
        collection: &str,
        matching: &Filter,
        doc: Value,
        identity: &Identity,
    ) -> Result<u64>;

    async fn delete_one(&self, collection: &str, id: &str, identity: &Identity) -> Result<bool>;

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        identity: &Identity,
    ) -> Result<u64>;
}

/// Stamp `_id`, audit fields and creator rights onto a document before it
/// is inserted. Shared by every store implementation.
pub fn prepare_insert(mut doc: Value, identity: &Identity) -> Result<Value> {
    let Some(obj) = doc.as_object_mut() else {
        return Err(Error::Validation("document must be an object".into()));
    };

    if !obj.get("_id").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
        obj.insert("_id".into(), Value::String(model::new_id()));
    }

    let stamps = serde_json::to_value(model::Audit::created_by(identity))?;
    if let Value::Object(stamps) = stamps {
        for (key, value) in stamps {
            let absent = obj.get(&key).is_none_or(Value::is_null);
            if absent {
                obj.insert(key, value);
            }
        }
    }

    normalize_acl(&mut doc);
    if !identity.is_root() && !AuthorizationGate::document_has_right(identity, &doc, Right::Update)
    {
        let mut acl = model::acl::acl_of(&doc);
        add_right(&mut acl, &identity.id, &identity.name, Rights::FULL_CONTROL);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("_acl".into(), serde_json::to_value(acl)?);
        }
    }
    Ok(doc)
}

/// Refresh modification stamps and canonicalize the ACL before a replace.
pub fn prepare_update(mut doc: Value, identity: &Identity) -> Result<Value> {
    let Some(obj) = doc.as_object_mut() else {
        return Err(Error::Validation("document must be an object".into()));
    };
    obj.insert("_modified".into(), serde_json::to_value(Utc::now())?);
    obj.insert("_modifiedby".into(), Value::String(identity.name.clone()));
    obj.insert("_modifiedbyid".into(), Value::String(identity.id.clone()));
    normalize_acl(&mut doc);
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

/// Descriptor of a stored blob. Filters passed to [`BlobStore::find`] run
/// against this shape, so metadata fields are addressed as `metadata.wi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobInfo {
    #[serde(rename = "_id")]
    pub id: String,
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub length: u64,
    #[serde(rename = "uploadDate")]
    pub upload_date: DateTime<Utc>,
    pub metadata: Value,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
        metadata: Value,
    ) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn find(&self, filter: &Filter) -> Result<Vec<BlobInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_grants_creator_full_control_when_acl_lacks_update() {
        let caller = Identity::new("u1", "Ann", "ann");
        let doc = prepare_insert(json!({"name": "x", "_acl": []}), &caller).unwrap();
        assert!(AuthorizationGate::document_has_right(&caller, &doc, Right::Delete));
        assert_eq!(doc["_createdbyid"], json!("u1"));
        assert!(model::looks_like_id(doc["_id"].as_str().unwrap()));
    }

    #[test]
    fn insert_keeps_supplied_id_and_acl_for_root() {
        let doc = prepare_insert(json!({"_id": "fixed", "_acl": []}), &Identity::root()).unwrap();
        assert_eq!(doc["_id"], json!("fixed"));
        assert_eq!(doc["_acl"], json!([]));
    }
}
