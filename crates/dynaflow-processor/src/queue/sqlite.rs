// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite table-backed queue.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage, lock_expiry_millis};

const SCHEMA: &str = include_str!("../../migrations/queue/sqlite.sql");

/// Queue stored in a `queue_messages` table.
///
/// Locking is a single `UPDATE ... WHERE id = (SELECT ...)` statement, which
/// SQLite executes under its database write lock.
#[derive(Clone)]
pub struct SqliteMessageQueue {
    pool: SqlitePool,
    lock_duration: Duration,
}

impl SqliteMessageQueue {
    /// Wrap an existing pool and create the queue table if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self, QueueError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            lock_duration: Duration::from_secs(300),
        })
    }

    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        Self::new(pool).await
    }

    /// How long a read message stays hidden before it is redelivered.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    fn lock_until_millis(&self) -> i64 {
        lock_expiry_millis(Utc::now().timestamp_millis(), self.lock_duration)
    }
}

#[async_trait]
impl MessageQueue for SqliteMessageQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO queue_messages (queue_name, body, enqueued_at) VALUES (?1, ?2, ?3)")
            .bind(queue)
            .bind(body)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_next(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError> {
        let lock_token = Uuid::new_v4().to_string();

        let locked = sqlx::query(
            r#"
            UPDATE queue_messages
            SET lock_token = ?1, locked_until = ?2
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue_name = ?3 AND (locked_until IS NULL OR locked_until < ?4)
                ORDER BY id
                LIMIT 1
            )
            "#,
        )
        .bind(&lock_token)
        .bind(self.lock_until_millis())
        .bind(queue)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if locked.rows_affected() == 0 {
            return Ok(None);
        }

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, body FROM queue_messages WHERE lock_token = ?1")
                .bind(&lock_token)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, body)| QueueMessage {
            message_id: id.to_string(),
            lock_token,
            body,
        }))
    }

    async fn complete(&self, queue: &str, message: &QueueMessage) -> Result<(), QueueError> {
        let id: i64 = message
            .message_id
            .parse()
            .map_err(|_| QueueError::LockLost {
                message_id: message.message_id.clone(),
            })?;

        let deleted = sqlx::query(
            "DELETE FROM queue_messages WHERE queue_name = ?1 AND id = ?2 AND lock_token = ?3",
        )
        .bind(queue)
        .bind(id)
        .bind(&message.lock_token)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(QueueError::LockLost {
                message_id: message.message_id.clone(),
            });
        }
        Ok(())
    }

    async fn peek_count(&self, queue: &str) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
