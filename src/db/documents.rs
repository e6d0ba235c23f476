//! JSONB document store.
//!
//! Every collection shares the `documents` table. Reads, replaces and
//! deletes carry the caller's ACL check in the WHERE clause, so a row the
//! caller may not touch is indistinguishable from a missing one.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use super::sql::{push_acl, push_filter, push_order};
use crate::error::{Error, Result};
use crate::model::{Identity, Right};
use crate::store::{DocumentStore, Filter, Query, prepare_insert, prepare_update};

fn duplicate_key(err: sqlx::Error, collection: &str, id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            Error::Validation(format!("duplicate key {id} in {collection}"))
        }
        _ => Error::Storage(err),
    }
}

fn doc_id(doc: &Value) -> String {
    doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string()
}

fn select<'a>(collection: &str, filter: &Filter, identity: &Identity, head: &str) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(head);
    qb.push(" FROM documents WHERE collection = ");
    qb.push_bind(collection.to_string());
    qb.push(" AND ");
    push_filter(&mut qb, "doc", filter);
    qb.push(" AND ");
    push_acl(&mut qb, "doc", identity, Right::Read);
    qb
}

#[async_trait]
impl DocumentStore for super::Db {
    async fn query(
        &self,
        collection: &str,
        query: &Query,
        identity: &Identity,
    ) -> Result<Vec<Value>> {
        let mut qb = select(collection, &query.filter, identity, "SELECT doc");
        push_order(&mut qb, "doc", &query.sort);
        if let Some(top) = query.top {
            qb.push(" LIMIT ");
            qb.push_bind(top as i64);
        }
        if query.skip > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(query.skip as i64);
        }
        let rows: Vec<(Value,)> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows.into_iter().map(|(doc,)| doc).collect())
    }

    async fn count(&self, collection: &str, filter: &Filter, identity: &Identity) -> Result<u64> {
        let mut qb = select(collection, filter, identity, "SELECT count(*)");
        let (count,): (i64,) = qb.build_query_as().fetch_one(self.pool()).await?;
        Ok(count.max(0) as u64)
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

        let mut tx = self.pool().begin().await?;
        for doc in &prepared {
            let id = doc_id(doc);
            sqlx::query("INSERT INTO documents (collection, id, doc) VALUES ($1, $2, $3)")
                .bind(collection)
                .bind(&id)
                .bind(doc)
                .execute(&mut *tx)
                .await
                .map_err(|e| duplicate_key(e, collection, &id))?;
        }
        tx.commit().await?;
        Ok(prepared)
    }

    async fn update_one(
        &self,
        collection: &str,
        matching: &Filter,
        doc: Value,
        identity: &Identity,
    ) -> Result<u64> {
        let replacement = prepare_update(doc, identity)?;

        // The locking subselect re-checks the filter against the committed
        // row after waiting, so two racing replaces cannot both match.
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE documents SET doc = jsonb_set(");
        qb.push_bind(replacement);
        qb.push(", '{_id}', to_jsonb(id)) WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND id = (SELECT id FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND ");
        push_filter(&mut qb, "doc", matching);
        qb.push(" AND ");
        push_acl(&mut qb, "doc", identity, Right::Update);
        qb.push(" LIMIT 1 FOR UPDATE)");

        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn delete_one(&self, collection: &str, id: &str, identity: &Identity) -> Result<bool> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND id = ");
        qb.push_bind(id.to_string());
        qb.push(" AND ");
        push_acl(&mut qb, "doc", identity, Right::Delete);
        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        identity: &Identity,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        qb.push(" AND ");
        push_filter(&mut qb, "doc", filter);
        qb.push(" AND ");
        push_acl(&mut qb, "doc", identity, Right::Delete);
        let result = qb.build().execute(self.pool()).await?;
        Ok(result.rows_affected())
    }
}
