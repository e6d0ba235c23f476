//! Plain document commands against the document store.
//!
//! Every call runs with the caller's identity, so the store's ACL checks
//! decide what is visible and what may change.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::model::Identity;
use crate::store::filter::filter_from_json;
use crate::store::{DocumentStore, Filter, Query, Sort, SortKind};

const DEFAULT_TOP: usize = 100;
const MAX_TOP: usize = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub top: Option<usize>,
    #[serde(default)]
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub query: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertOneRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub item: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertManyRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Replace one document. It is matched by `query` when given, otherwise by
/// the item's `_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOneRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub item: Value,
    #[serde(default)]
    pub query: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOneRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteManyRequest {
    #[serde(default)]
    pub collectionname: String,
    #[serde(default)]
    pub query: Option<Value>,
    #[serde(default)]
    pub ids: Vec<String>,
}

fn collection(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::mandatory("collectionname"));
    }
    Ok(name)
}

pub(crate) async fn query(store: &dyn DocumentStore, identity: &Identity, req: QueryRequest) -> Result<Value> {
    let top = req.top.filter(|t| *t > 0).unwrap_or(DEFAULT_TOP).min(MAX_TOP);
    let query = Query::new(filter_from_json(&req.query))
        .sort(Sort::desc("_created", SortKind::Time))
        .top(top)
        .skip(req.skip.unwrap_or_default());
    let docs = store.query(collection(&req.collectionname)?, &query, identity).await?;
    Ok(Value::Array(docs))
}

pub(crate) async fn count(store: &dyn DocumentStore, identity: &Identity, req: CountRequest) -> Result<Value> {
    let n = store
        .count(collection(&req.collectionname)?, &filter_from_json(&req.query), identity)
        .await?;
    Ok(json!(n))
}

pub(crate) async fn insert_one(
    store: &dyn DocumentStore,
    identity: &Identity,
    req: InsertOneRequest,
) -> Result<Value> {
    if !req.item.is_object() {
        return Err(Error::mandatory("item"));
    }
    store.insert_one(collection(&req.collectionname)?, req.item, identity).await
}

pub(crate) async fn insert_many(
    store: &dyn DocumentStore,
    identity: &Identity,
    req: InsertManyRequest,
) -> Result<Value> {
    if req.items.is_empty() {
        return Err(Error::mandatory("items"));
    }
    let docs = store
        .insert_many(collection(&req.collectionname)?, req.items, identity)
        .await?;
    Ok(Value::Array(docs))
}

pub(crate) async fn update_one(
    store: &dyn DocumentStore,
    identity: &Identity,
    req: UpdateOneRequest,
) -> Result<Value> {
    let collection = collection(&req.collectionname)?;
    let matching = match &req.query {
        Some(query) if query.as_object().is_some_and(|q| !q.is_empty()) => filter_from_json(query),
        _ => {
            let id = req
                .item
                .get("_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Error::mandatory("item._id"))?;
            Filter::id(id)
        }
    };
    let updated = store.update_one(collection, &matching, req.item.clone(), identity).await?;
    if updated == 0 {
        return Err(Error::AccessDenied(format!(
            "Unknown document in {collection} or {} is missing update rights",
            identity.username
        )));
    }
    Ok(req.item)
}

pub(crate) async fn delete_one(
    store: &dyn DocumentStore,
    identity: &Identity,
    req: DeleteOneRequest,
) -> Result<Value> {
    if req.id.is_empty() {
        return Err(Error::mandatory("id"));
    }
    let collection = collection(&req.collectionname)?;
    if !store.delete_one(collection, &req.id, identity).await? {
        return Err(Error::NotFound(format!(
            "Could not find {} in {collection}, or missing delete rights",
            req.id
        )));
    }
    Ok(json!(1))
}

pub(crate) async fn delete_many(
    store: &dyn DocumentStore,
    identity: &Identity,
    req: DeleteManyRequest,
) -> Result<Value> {
    let collection = collection(&req.collectionname)?;
    if !req.ids.is_empty() {
        let mut deleted = 0u64;
        for id in &req.ids {
            if store.delete_one(collection, id, identity).await? {
                deleted += 1;
            }
        }
        return Ok(json!(deleted));
    }
    let filter = match &req.query {
        Some(query) if query.as_object().is_some_and(|q| !q.is_empty()) => filter_from_json(query),
        _ => return Err(Error::mandatory("query or ids")),
    };
    let deleted = store.delete_many(collection, &filter, identity).await?;
    Ok(json!(deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    fn ann() -> Identity {
        Identity::new("5f0c1d2e3a4b5c6d7e8f9a0b", "Ann", "ann")
    }

    #[tokio::test]
    async fn inserted_documents_are_owned_by_creator() {
        let store = MemoryDocumentStore::new();
        insert_one(
            &store,
            &ann(),
            InsertOneRequest {
                collectionname: "entities".into(),
                item: json!({"_type": "note", "text": "hi"}),
            },
        )
        .await
        .unwrap();

        let mine = query(
            &store,
            &ann(),
            QueryRequest {
                collectionname: "entities".into(),
                query: json!({"_type": "note"}),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(mine.as_array().unwrap().len(), 1);

        let theirs = count(
            &store,
            &Identity::new("0123456789abcdef01234567", "Bob", "bob"),
            CountRequest {
                collectionname: "entities".into(),
                query: json!({}),
            },
        )
        .await
        .unwrap();
        assert_eq!(theirs, json!(0));
    }

    #[tokio::test]
    async fn delete_many_needs_a_filter() {
        let store = MemoryDocumentStore::new();
        let err = delete_many(
            &store,
            &ann(),
            DeleteManyRequest {
                collectionname: "entities".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "query or ids is mandatory");
    }

    #[tokio::test]
    async fn missing_collection_is_rejected() {
        let store = MemoryDocumentStore::new();
        let err = count(&store, &ann(), CountRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "collectionname is mandatory");
    }
}
