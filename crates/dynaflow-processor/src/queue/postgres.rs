// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL table-backed queue using `FOR UPDATE SKIP LOCKED`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage, lock_expiry_millis};

const SCHEMA: &str = include_str!("../../migrations/queue/postgresql.sql");

#[derive(Clone)]
pub struct PgMessageQueue {
    pool: PgPool,
    lock_duration: Duration,
}

impl PgMessageQueue {
    /// Wrap an existing pool and create the queue table if needed.
    pub async fn new(pool: PgPool) -> Result<Self, QueueError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            lock_duration: Duration::from_secs(300),
        })
    }

    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Self::new(pool).await
    }

    /// How long a read message stays hidden before it is redelivered.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }
}

#[async_trait]
impl MessageQueue for PgMessageQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        sqlx::query("INSERT INTO queue_messages (queue_name, body, enqueued_at) VALUES ($1, $2, $3)")
            .bind(queue)
            .bind(body)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_next(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let lock_token = Uuid::new_v4().to_string();

        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET lock_token = $1, locked_until = $2
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue_name = $3 AND (locked_until IS NULL OR locked_until < $4)
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, body
            "#,
        )
        .bind(&lock_token)
        .bind(lock_expiry_millis(now, self.lock_duration))
        .bind(queue)
        .bind(now)
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
            "DELETE FROM queue_messages WHERE queue_name = $1 AND id = $2 AND lock_token = $3",
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
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
