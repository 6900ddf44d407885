// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message queue bridge between the master and task-runner roles.
//!
//! Queues use peek-lock semantics: [`MessageQueue::read_next`] hides a
//! message from other readers and [`MessageQueue::complete`] removes it. A
//! table-backed message that is read but never completed becomes visible
//! again once its lock expires.
//!
//! The store stays authoritative. Messages only carry task codes, which the
//! runner resolves back to rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynaflow_core::{DynaFlowTask, TaskRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::InMemoryQueue;
pub use postgres::PgMessageQueue;
pub use sqlite::SqliteMessageQueue;

/// Queue errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported queue connection string '{0}' (expected memory://, sqlite: or postgres://)")]
    UnsupportedConnectionString(String),

    #[error("message {message_id} is not locked by this reader")]
    LockLost { message_id: String },
}

/// A message read from a queue and locked for this reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub lock_token: String,
    pub body: String,
}

/// Peek-lock message queue with named logical queues.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError>;

    /// Next visible message, or `None` when the queue is empty. Never blocks.
    async fn read_next(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError>;

    /// Remove a message previously returned by `read_next`.
    async fn complete(&self, queue: &str, message: &QueueMessage) -> Result<(), QueueError>;

    /// Number of messages in the queue, locked ones included.
    async fn peek_count(&self, queue: &str) -> Result<u64, QueueError>;
}

/// Open the queue backend named by a connection string.
pub async fn connect(connection_string: &str) -> Result<Arc<dyn MessageQueue>, QueueError> {
    if connection_string.starts_with("memory:") {
        Ok(Arc::new(InMemoryQueue::new()))
    } else if connection_string.starts_with("sqlite:") {
        Ok(Arc::new(SqliteMessageQueue::connect(connection_string).await?))
    } else if connection_string.starts_with("postgres://")
        || connection_string.starts_with("postgresql://")
    {
        Ok(Arc::new(PgMessageQueue::connect(connection_string).await?))
    } else {
        Err(QueueError::UnsupportedConnectionString(
            connection_string.to_string(),
        ))
    }
}

/// Epoch millis at which a lock taken at `now_millis` expires. Saturates
/// instead of overflowing for very long locks.
pub(crate) fn lock_expiry_millis(now_millis: i64, lock: Duration) -> i64 {
    now_millis.saturating_add(i64::try_from(lock.as_millis()).unwrap_or(i64::MAX))
}

/// Processor-queue payload: a claimed task to run.
///
/// `claimed_by` and `claimed_at` identify the claim the master took before
/// sending. A consumer only runs the task while the row still carries that
/// claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_code: String,
    pub task_id: i64,
    pub dyna_flow_id: i64,
    pub task_type: String,
    #[serde(default)]
    pub claimed_by: String,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    /// Message for `task` as stored right after its claim.
    pub fn claimed(task_ref: &TaskRef, task: &DynaFlowTask) -> Self {
        Self {
            task_code: task.code.clone(),
            task_id: task.id,
            dyna_flow_id: task.dyna_flow_id,
            task_type: task_ref.task_type_name.clone(),
            claimed_by: task.processor_identifier.clone(),
            claimed_at: task.started_utc_date_time,
        }
    }
}

/// Result-queue payload: final state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultMessage {
    pub task_code: String,
    pub task_id: i64,
    pub dyna_flow_id: i64,
    pub processor_identifier: String,
    pub is_successful: bool,
    pub is_canceled: bool,
    pub retry_count: i32,
    pub result_value: Option<String>,
    pub last_error: Option<String>,
    pub completed_utc_date_time: Option<DateTime<Utc>>,
}

impl From<&DynaFlowTask> for TaskResultMessage {
    fn from(task: &DynaFlowTask) -> Self {
        Self {
            task_code: task.code.clone(),
            task_id: task.id,
            dyna_flow_id: task.dyna_flow_id,
            processor_identifier: task.processor_identifier.clone(),
            is_successful: task.is_successful,
            is_canceled: task.is_canceled,
            retry_count: task.retry_count,
            result_value: task.result_value.clone(),
            last_error: task.last_error.clone(),
            completed_utc_date_time: task.completed_utc_date_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_selects_backend() {
        let queue = connect("memory://").await.unwrap();
        queue.send("q", "hello").await.unwrap();
        assert_eq!(queue.peek_count("q").await.unwrap(), 1);

        assert!(matches!(
            connect("amqp://broker").await,
            Err(QueueError::UnsupportedConnectionString(_))
        ));
    }

    #[test]
    fn test_lock_expiry_saturates() {
        assert_eq!(lock_expiry_millis(1_000, Duration::from_secs(300)), 301_000);
        assert_eq!(lock_expiry_millis(1_000, Duration::MAX), i64::MAX);
        assert_eq!(
            lock_expiry_millis(1_000, Duration::from_millis(i64::MAX as u64)),
            i64::MAX
        );
    }

    #[test]
    fn test_task_message_wire_format() {
        let task_ref = TaskRef {
            task_id: 3,
            task_code: "c0de".to_string(),
            dyna_flow_id: 9,
            task_type_name: "Fetch".to_string(),
            priority_level: 1,
        };
        let claimed_at = DateTime::parse_from_rfc3339("2025-03-01T10:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let task = DynaFlowTask {
            id: 3,
            code: "c0de".to_string(),
            dyna_flow_id: 9,
            dyna_flow_task_type_id: 1,
            processor_identifier: "master-1".to_string(),
            retry_count: 0,
            max_retry_count: 2,
            min_start_utc_date_time: None,
            requested_utc_date_time: claimed_at,
            started_utc_date_time: Some(claimed_at),
            completed_utc_date_time: None,
            is_started: true,
            is_completed: false,
            is_successful: false,
            is_canceled: false,
            is_run_task_debug_required: false,
            param: None,
            result_value: None,
            last_error: None,
        };

        let message = TaskMessage::claimed(&task_ref, &task);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["task_code"], "c0de");
        assert_eq!(json["task_id"], 3);
        assert_eq!(json["dyna_flow_id"], 9);
        assert_eq!(json["task_type"], "Fetch");
        assert_eq!(json["claimed_by"], "master-1");
        let back: TaskMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.claimed_at, Some(claimed_at));
        assert_eq!(back, message);
    }

    #[test]
    fn test_task_message_without_claim_fields() {
        let message: TaskMessage = serde_json::from_str(
            r#"{"task_code":"c0de","task_id":3,"dyna_flow_id":9,"task_type":"Fetch"}"#,
        )
        .unwrap();
        assert!(message.claimed_by.is_empty());
        assert!(message.claimed_at.is_none());
    }
}
