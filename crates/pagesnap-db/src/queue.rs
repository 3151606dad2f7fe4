//! Message queue on a PostgreSQL table.
//!
//! Receiving a message stamps it with a fresh receipt and pushes its
//! `visible_at` into the future; acknowledging deletes the row by receipt.
//! A worker that dies mid-job simply never acknowledges, and the message
//! becomes visible again once its visibility timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use pagesnap_core::defaults::{QUEUE_NAME, QUEUE_POLL_INTERVAL_MS, QUEUE_VISIBILITY_TIMEOUT_SECS};
use pagesnap_core::{Delivery, Error, JobMessage, MessageQueue, Result};

/// Queue configuration.
///
/// | Variable | Default |
/// |----------|---------|
/// | `QUEUE_NAME` | `screenshots` |
/// | `QUEUE_VISIBILITY_TIMEOUT_SECS` | `300` |
/// | `QUEUE_POLL_INTERVAL_MS` | `500` |
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue within the shared table.
    pub queue_name: String,
    /// How long a received message stays hidden.
    pub visibility_timeout: Duration,
    /// Re-check interval while long polling.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: QUEUE_NAME.to_string(),
            visibility_timeout: Duration::from_secs(QUEUE_VISIBILITY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(QUEUE_POLL_INTERVAL_MS),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_name: std::env::var("QUEUE_NAME").unwrap_or(defaults.queue_name),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            poll_interval: std::env::var("QUEUE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// PostgreSQL implementation of [`MessageQueue`].
#[derive(Clone)]
pub struct PgMessageQueue {
    pool: Pool<Postgres>,
    config: QueueConfig,
    /// Wakes local long pollers when this process enqueues.
    notify: Arc<Notify>,
}

impl PgMessageQueue {
    pub fn new(pool: Pool<Postgres>, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a raw body.
    pub async fn send_raw(&self, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO queue_messages (queue_name, body) VALUES ($1, $2)")
            .bind(&self.config.queue_name)
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Messages in the queue that have not been acknowledged.
    pub async fn queue_depth(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_messages WHERE queue_name = $1")
            .bind(&self.config.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;
        row.try_get("depth")
            .map_err(|e| Error::Queue(e.to_string()))
    }

    async fn take_visible(&self, max: usize) -> Result<Vec<Delivery>> {
        let rows = sqlx::query(
            "UPDATE queue_messages
             SET receipt = gen_random_uuid(),
                 receive_count = receive_count + 1,
                 visible_at = now() + make_interval(secs => $2)
             WHERE id IN (
                 SELECT id FROM queue_messages
                 WHERE queue_name = $1 AND visible_at <= now()
                 ORDER BY id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, receipt, body, receive_count",
        )
        .bind(&self.config.queue_name)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Queue(e.to_string()))?;

        let mut deliveries = rows
            .into_iter()
            .map(|row| -> std::result::Result<(i64, Delivery), sqlx::Error> {
                let id: i64 = row.try_get("id")?;
                let receipt: Uuid = row.try_get("receipt")?;
                let receive_count: i32 = row.try_get("receive_count")?;
                Ok((
                    id,
                    Delivery {
                        receipt: receipt.to_string(),
                        body: row.try_get("body")?,
                        receive_count: receive_count.max(0) as u32,
                    },
                ))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Queue(e.to_string()))?;
        deliveries.sort_by_key(|(id, _)| *id);
        Ok(deliveries.into_iter().map(|(_, d)| d).collect())
    }
}

#[async_trait]
impl MessageQueue for PgMessageQueue {
    async fn send(&self, message: &JobMessage) -> Result<()> {
        self.send_raw(&message.encode()?).await
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_visible(max).await?;
            if !batch.is_empty() {
                debug!(
                    subsystem = "db",
                    component = "queue",
                    op = "receive",
                    count = batch.len(),
                    "Received messages"
                );
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                trace!(subsystem = "db", component = "queue", "Receive timed out empty");
                return Ok(Vec::new());
            }
            let wake_at = (now + self.config.poll_interval).min(deadline);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let Ok(receipt_id) = Uuid::parse_str(receipt) else {
            debug!(
                subsystem = "db",
                component = "queue",
                op = "ack",
                receipt,
                "Ignoring ack for malformed receipt"
            );
            return Ok(());
        };

        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt = $1")
            .bind(receipt_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(
                subsystem = "db",
                component = "queue",
                op = "ack",
                receipt,
                "Stale receipt, message already acked or redelivered"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.queue_name, "screenshots");
        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::default()
            .with_queue_name("test-queue")
            .with_visibility_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.queue_name, "test-queue");
        assert_eq!(config.visibility_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }
}
