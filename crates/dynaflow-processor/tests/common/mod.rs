// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for dynaflow-processor integration tests.
//!
//! Each harness runs a processor over its own in-memory SQLite store with a
//! small registry of test handlers.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dynaflow_core::{
    DynaFlow, DynaFlowTask, FlowTypeSpec, RecordKey, SqliteTaskStore, StoreError, StoreSession,
    TaskStore, TaskTypeSpec,
};
use dynaflow_processor::config::{Config, QueueNames};
use dynaflow_processor::queue::{InMemoryQueue, MessageQueue};
use dynaflow_processor::registry::{
    FlowBuilder, FlowRegistry, HandlerError, NewTaskSpec, TaskContext, TaskHandler, TaskOutput,
};
use dynaflow_processor::runtime::ProcessorRuntime;

pub const WORKER: &str = "worker-test";

/// Retries allowed for `AlwaysFail` tasks.
pub const FAIL_RETRIES: i32 = 2;

/// Succeeds, echoing its parameter.
pub struct Succeed;

#[async_trait]
impl TaskHandler for Succeed {
    async fn process(&self, ctx: &TaskContext) -> Result<TaskOutput, HandlerError> {
        Ok(TaskOutput {
            result_value: ctx.task.param.clone(),
        })
    }
}

/// Fails every time and counts its invocations.
pub struct AlwaysFail {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for AlwaysFail {
    async fn process(&self, _ctx: &TaskContext) -> Result<TaskOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::failed("upstream unavailable"))
    }
}

/// Builds one task per entry of the flow parameter, a JSON array of task
/// type names.
pub struct Fanout;

#[async_trait]
impl FlowBuilder for Fanout {
    async fn build_tasks(&self, flow: &DynaFlow) -> Result<Vec<NewTaskSpec>, HandlerError> {
        let raw = flow
            .param
            .as_deref()
            .ok_or_else(|| HandlerError::InvalidParam("missing task list".to_string()))?;
        let names: Vec<String> = serde_json::from_str(raw)?;
        Ok(names.into_iter().map(NewTaskSpec::new).collect())
    }
}

pub struct BrokenBuild;

#[async_trait]
impl FlowBuilder for BrokenBuild {
    async fn build_tasks(&self, _flow: &DynaFlow) -> Result<Vec<NewTaskSpec>, HandlerError> {
        Err(HandlerError::failed("source system rejected the export"))
    }
}

pub struct EmptyBuild;

#[async_trait]
impl FlowBuilder for EmptyBuild {
    async fn build_tasks(&self, _flow: &DynaFlow) -> Result<Vec<NewTaskSpec>, HandlerError> {
        Ok(Vec::new())
    }
}

/// Store whose next `begin` calls fail while failures are armed.
pub struct FlakyStore {
    inner: Arc<dyn TaskStore>,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn TaskStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` units of work.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn armed(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Database {
                operation: "begin",
                details: "connection reset".to_string(),
            });
        }
        self.inner.begin().await
    }
}

pub fn registry(fail_calls: Arc<AtomicUsize>) -> FlowRegistry {
    let mut registry = FlowRegistry::with_builtins();
    registry
        .register_task(TaskTypeSpec::new("Succeed", 2), Arc::new(Succeed))
        .unwrap()
        .register_task(
            TaskTypeSpec::new("AlwaysFail", FAIL_RETRIES),
            Arc::new(AlwaysFail { calls: fail_calls }),
        )
        .unwrap()
        .register_flow(FlowTypeSpec::new("Fanout", 5), Arc::new(Fanout))
        .unwrap()
        .register_flow(FlowTypeSpec::new("BrokenBuild", 1), Arc::new(BrokenBuild))
        .unwrap()
        .register_flow(FlowTypeSpec::new("Empty", 1), Arc::new(EmptyBuild))
        .unwrap();
    registry
}

pub fn queue_names() -> QueueNames {
    QueueNames {
        processor: "dynaflow-processor".to_string(),
        result: "dynaflow-result".to_string(),
        dead_letter: "dynaflow-dead-letter".to_string(),
    }
}

pub struct Harness {
    pub store: Arc<dyn TaskStore>,
    pub runtime: ProcessorRuntime,
    pub queue: Arc<InMemoryQueue>,
    pub fail_calls: Arc<AtomicUsize>,
}

impl Harness {
    /// Processor in DB-poll mode with both roles and a zero retry backoff.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Processor in queue mode over an in-memory queue.
    pub async fn queued() -> Self {
        Self::with_config(|config| {
            config.task_queue_enabled = true;
            config.queue_names = queue_names();
        })
        .await
    }

    pub async fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let store: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::connect("sqlite::memory:")
                .await
                .expect("Failed to create in-memory store"),
        );
        Self::over_store(store, configure).await
    }

    pub async fn over_store(store: Arc<dyn TaskStore>, configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::new("sqlite::memory:");
        config.processor_identifier = Some(WORKER.to_string());
        config.retry_backoff = Duration::ZERO;
        config.poll_interval = Duration::from_millis(10);
        configure(&mut config);

        let queue = Arc::new(InMemoryQueue::new());
        let fail_calls = Arc::new(AtomicUsize::new(0));
        let runtime = ProcessorRuntime::builder()
            .config(config)
            .store(store.clone())
            .queue(queue.clone() as Arc<dyn MessageQueue>)
            .registry(registry(fail_calls.clone()))
            .build()
            .await
            .expect("Failed to build runtime");

        Self {
            store,
            runtime,
            queue,
            fail_calls,
        }
    }

    pub async fn flow(&self, code: &str) -> DynaFlow {
        let mut uow = self.store.begin().await.unwrap();
        uow.load_flow(RecordKey::Code(code))
            .await
            .unwrap()
            .expect("flow should exist")
    }

    pub async fn tasks(&self, flow_id: i64) -> Vec<DynaFlowTask> {
        let mut uow = self.store.begin().await.unwrap();
        uow.list_flow_tasks(flow_id).await.unwrap()
    }

    pub async fn task(&self, task_id: i64) -> DynaFlowTask {
        let mut uow = self.store.begin().await.unwrap();
        uow.load_task(RecordKey::Id(task_id))
            .await
            .unwrap()
            .expect("task should exist")
    }

    pub fn fail_calls(&self) -> usize {
        self.fail_calls.load(Ordering::SeqCst)
    }
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
