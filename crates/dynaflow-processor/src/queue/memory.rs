// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process queue for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{MessageQueue, QueueError, QueueMessage};

#[derive(Default)]
struct Queues {
    ready: HashMap<String, VecDeque<(String, String)>>,
    /// Locked messages by (queue, lock token).
    in_flight: HashMap<(String, String), String>,
}

/// Queue backed by in-process maps. Messages do not survive the process.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<Queues>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back((Uuid::new_v4().to_string(), body.to_string()));
        Ok(())
    }

    async fn read_next(&self, queue: &str) -> Result<Option<QueueMessage>, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some((message_id, body)) = inner.ready.get_mut(queue).and_then(|q| q.pop_front())
        else {
            return Ok(None);
        };

        let lock_token = Uuid::new_v4().to_string();
        inner
            .in_flight
            .insert((queue.to_string(), lock_token.clone()), message_id.clone());

        Ok(Some(QueueMessage {
            message_id,
            lock_token,
            body,
        }))
    }

    async fn complete(&self, queue: &str, message: &QueueMessage) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner
            .in_flight
            .remove(&(queue.to_string(), message.lock_token.clone()))
        {
            Some(_) => Ok(()),
            None => Err(QueueError::LockLost {
                message_id: message.message_id.clone(),
            }),
        }
    }

    async fn peek_count(&self, queue: &str) -> Result<u64, QueueError> {
        let inner = self.inner.lock().await;
        let ready = inner.ready.get(queue).map_or(0, |q| q.len());
        let in_flight = inner.in_flight.keys().filter(|(q, _)| q == queue).count();
        Ok((ready + in_flight) as u64)
    }
}
