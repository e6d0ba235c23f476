//! Postgres backend: connection pool, migrations, and health check.
//!
//! One `Db` implements all three storage seams. Documents live as JSONB
//! rows keyed by collection, blobs as `bytea`, and the message bus is pgmq
//! plus a small exchange/binding table.

pub mod blobs;
pub mod documents;
pub mod pgmq;
pub mod sql;

use std::sync::Arc;

use crate::dispatch::Backends;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check, runs a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Use this database for documents, blobs and messaging.
    pub fn into_backends(self) -> Backends {
        let db = Arc::new(self);
        Backends {
            store: db.clone(),
            blobs: db.clone(),
            bus: db,
        }
    }
}
