//! Blob storage in a `bytea` table.
//!
//! `find` runs the filter against a JSON projection of each row shaped
//! like [`BlobInfo`], so `metadata.wi` addresses the same field it does in
//! the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

use super::sql::push_filter;
use crate::error::Result;
use crate::model;
use crate::store::{BlobInfo, BlobStore, Filter};

type BlobRow = (String, String, String, i64, DateTime<Utc>, Value);

#[async_trait]
impl BlobStore for super::Db {
    async fn save(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
        metadata: Value,
    ) -> Result<String> {
        let id = model::new_id();
        sqlx::query(
            "INSERT INTO blobs (id, filename, content_type, length, upload_date, metadata, data) \
             VALUES ($1, $2, $3, $4, now(), $5, $6)",
        )
        .bind(&id)
        .bind(filename)
        .bind(content_type)
        .bind(bytes.len() as i64)
        .bind(metadata)
        .bind(bytes)
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM blobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<BlobInfo>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, filename, content_type, length, upload_date, metadata FROM \
             (SELECT *, jsonb_build_object('_id', id, 'filename', filename, 'contentType', content_type, \
             'length', length, 'uploadDate', upload_date, 'metadata', metadata) AS info FROM blobs) b WHERE ",
        );
        push_filter(&mut qb, "info", filter);
        qb.push(" ORDER BY upload_date");
        let rows: Vec<BlobRow> = qb.build_query_as().fetch_all(self.pool()).await?;
        Ok(rows
            .into_iter()
            .map(|(id, filename, content_type, length, upload_date, metadata)| BlobInfo {
                id,
                filename,
                content_type,
                length: length.max(0) as u64,
                upload_date,
                metadata,
            })
            .collect())
    }
}
