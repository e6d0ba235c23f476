//! In-memory document and blob stores for development and tests.
//!
//! Each collection is a `Vec` behind one `RwLock`, so a conditional update
//! checks its match filter and writes under the same write guard.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{BlobInfo, BlobStore, DocumentStore, Filter, Query, prepare_insert, prepare_update};
use crate::auth::AuthorizationGate;
use crate::error::{Error, Result};
use crate::model::{self, Identity, Right};

#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<RwLock<HashMap<String, Vec<Value>>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total documents in a collection, ignoring ACLs. For tests.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn query(
        &self,
        collection: &str,
        query: &Query,
        identity: &Identity,
    ) -> Result<Vec<Value>> {
        let guard = self.collections.read().await;
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Value> = docs
            .iter()
            .filter(|d| query.filter.matches(d))
            .filter(|d| AuthorizationGate::document_has_right(identity, d, Right::Read))
            .cloned()
            .collect();
        if !query.sort.is_empty() {
            hits.sort_by(|a, b| query.compare(a, b));
        }

        let hits = hits.into_iter().skip(query.skip);
        Ok(match query.top {
            Some(top) => hits.take(top).collect(),
            None => hits.collect(),
        })
    }

    async fn count(&self, collection: &str, filter: &Filter, identity: &Identity) -> Result<u64> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(d))
                    .filter(|d| AuthorizationGate::document_has_right(identity, d, Right::Read))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn insert_one(&self, collection: &str, doc: Value, identity: &Identity) -> Result<Value> {
        let mut inserted = self.insert_many(collection, vec![doc], identity).await?;
        inserted
            .pop()
            .ok_or_else(|| Error::Other("insert produced no document".into()))
    }

    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        identity: &Identity,
    ) -> Result<Vec<Value>> {
        let prepared = docs
            .into_iter()
            .map(|d| prepare_insert(d, identity))
            .collect::<Result<Vec<_>>>()?;

        let mut guard = self.collections.write().await;
        let existing = guard.entry(collection.to_string()).or_default();
        for doc in &prepared {
            let id = doc_id(doc);
            if existing.iter().any(|d| doc_id(d) == id) {
                return Err(Error::Validation(format!(
                    "duplicate key {} in {collection}",
                    id.unwrap_or_default()
                )));
            }
        }
        existing.extend(prepared.iter().cloned());
        Ok(prepared)
    }

    async fn update_one(
        &self,
        collection: &str,
        matching: &Filter,
        doc: Value,
        identity: &Identity,
    ) -> Result<u64> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let Some(slot) = docs.iter_mut().find(|d| {
            matching.matches(d) && AuthorizationGate::document_has_right(identity, d, Right::Update)
        }) else {
            return Ok(0);
        };

        let mut replacement = prepare_update(doc, identity)?;
        if let (Some(obj), Some(id)) = (replacement.as_object_mut(), slot.get("_id").cloned()) {
            obj.insert("_id".into(), id);
        }
        *slot = replacement;
        Ok(1)
    }

    async fn delete_one(&self, collection: &str, id: &str, identity: &Identity) -> Result<bool> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(false);
        };
        let position = docs.iter().position(|d| {
            doc_id(d) == Some(id) && AuthorizationGate::document_has_right(identity, d, Right::Delete)
        });
        Ok(match position {
            Some(index) => {
                docs.remove(index);
                true
            }
            None => false,
        })
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        identity: &Identity,
    ) -> Result<u64> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| {
            !(filter.matches(d) && AuthorizationGate::document_has_right(identity, d, Right::Delete))
        });
        Ok((before - docs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, (BlobInfo, Vec<u8>)>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
        metadata: Value,
    ) -> Result<String> {
        let info = BlobInfo {
            id: model::new_id(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            length: bytes.len() as u64,
            upload_date: Utc::now(),
            metadata,
        };
        let id = info.id.clone();
        self.blobs.write().await.insert(id.clone(), (info, bytes));
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(id).map(|(_, bytes)| bytes.clone()))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(id).is_some())
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<BlobInfo>> {
        let guard = self.blobs.read().await;
        let mut found = Vec::new();
        for (info, _) in guard.values() {
            if filter.matches(&serde_json::to_value(info)?) {
                found.push(info.clone());
            }
        }
        Ok(found)
    }
}
