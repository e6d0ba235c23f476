//! Message bus over pgmq via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll
//! and pgmq.delete. pgmq has no exchanges, so exchange declarations and
//! bindings live in `bus_exchanges` / `bus_bindings` and `send` fans out
//! to the bound queues itself. Each pgmq message body is a serialized
//! [`Delivery`], which carries correlation id, reply-to and expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::store::{Delivery, ExchangeAlgorithm, MessageBus, OutboundMessage};
use crate::telemetry::metrics;

/// pgmq queue names are limited to lowercase letters, digits and
/// underscores, and to 47 characters.
pub fn pgmq_name(queue: &str) -> String {
    let mut name: String = queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    name.truncate(47);
    name
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    async fn send_to_queue(&self, queue: &str, delivery: &Delivery) -> Result<i64> {
        let body = serde_json::to_value(delivery)?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(pgmq_name(queue))
            .bind(body)
            .fetch_one(self.pool())
            .await?;
        record(queue, "send");
        Ok(row.0)
    }

    /// Read and delete the next message, polling up to `wait`.
    async fn read_from_queue(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let name = pgmq_name(queue);
        let row: Option<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, message FROM pgmq.read_with_poll($1, 30, 1, $2, 100)")
                .bind(&name)
                .bind(wait.as_secs().clamp(1, i32::MAX as u64) as i32)
                .fetch_optional(self.pool())
                .await?;

        let Some((msg_id, message)) = row else {
            record(queue, "read_empty");
            return Ok(None);
        };
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(&name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue, "read");
        Ok(Some(serde_json::from_value(message)?))
    }
}

#[async_trait]
impl MessageBus for super::Db {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(pgmq_name(name))
            .execute(self.pool())
            .await?;
        record(name, "create");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, algorithm: ExchangeAlgorithm) -> Result<()> {
        sqlx::query(
            "INSERT INTO bus_exchanges (name, algorithm) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(algorithm.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn bind_queue(&self, exchange: &str, queue: &str, routing_key: &str) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO bus_bindings (exchange, queue, routing_key) \
             SELECT name, $2, $3 FROM bus_exchanges WHERE name = $1 \
             ON CONFLICT DO NOTHING",
        )
        .bind(exchange)
        .bind(queue)
        .bind(routing_key)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT name FROM bus_exchanges WHERE name = $1")
                .bind(exchange)
                .fetch_optional(self.pool())
                .await?;
            if exists.is_none() {
                return Err(Error::NotFound(format!("exchange {exchange} not found")));
            }
        }
        Ok(())
    }

    async fn send(&self, msg: OutboundMessage) -> Result<()> {
        let targets: Vec<String> = if msg.exchange.is_empty() {
            vec![msg.queue.clone()]
        } else {
            let algorithm: Option<(String,)> =
                sqlx::query_as("SELECT algorithm FROM bus_exchanges WHERE name = $1")
                    .bind(&msg.exchange)
                    .fetch_optional(self.pool())
                    .await?;
            let Some((algorithm,)) = algorithm else {
                return Err(Error::NotFound(format!("exchange {} not found", msg.exchange)));
            };
            let algorithm: ExchangeAlgorithm = algorithm.parse()?;
            let bindings: Vec<(String, String)> =
                sqlx::query_as("SELECT queue, routing_key FROM bus_bindings WHERE exchange = $1")
                    .bind(&msg.exchange)
                    .fetch_all(self.pool())
                    .await?;
            bindings
                .into_iter()
                .filter(|(_, key)| algorithm.routes(key, &msg.routing_key))
                .map(|(queue, _)| queue)
                .collect()
        };

        for queue in targets {
            self.send_to_queue(&queue, &Delivery::from_message(&queue, &msg))
                .await?;
        }
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Utc::now() + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero());
        loop {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
            let Some(delivery) = self.read_from_queue(queue, remaining).await? else {
                return Ok(None);
            };
            if !delivery.is_expired() {
                return Ok(Some(delivery));
            }
            tracing::debug!(queue, "dropping expired message");
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }
}
