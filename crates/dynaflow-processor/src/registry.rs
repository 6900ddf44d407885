// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static registry of task handlers and flow builders.
//!
//! Task types and flow types are resolved by their `lookup_enum_name`. The
//! registry also declares the catalog rows that bootstrap upserts, so the
//! store and the code always agree on which names exist.
//!
//! Dispatch runs the handler on its own tokio task: a panicking handler is
//! reported as [`FailureKind::Panicked`] and goes through the retry policy
//! like any other failure instead of taking the processing loop down.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynaflow_core::{DynaFlow, DynaFlowTask, FlowTypeSpec, TaskTypeSpec};
use thiserror::Error;

use crate::error::{Error, Result};

/// Everything a handler may read about the task it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: DynaFlowTask,
    pub flow: DynaFlow,
    /// Task type name the handler was resolved by.
    pub task_type: String,
    /// Identifier of the processor running the task.
    pub processor_identifier: String,
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    /// Stored on the task row as `result_value`.
    pub result_value: Option<String>,
}

impl TaskOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            result_value: Some(value.into()),
        }
    }
}

/// Domain failure reported by a handler or builder.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Why a dispatch or build did not succeed.
#[derive(Debug, Error)]
pub enum FailureKind {
    /// The handler ran and returned an error.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// No handler is registered under the task or flow type name.
    #[error("no handler registered for '{0}'")]
    UnknownHandler(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Executes one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process(&self, ctx: &TaskContext) -> std::result::Result<TaskOutput, HandlerError>;
}

/// Task to be created by a flow builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTaskSpec {
    /// Task type name; must be registered.
    pub task_type: String,
    pub param: Option<String>,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub is_run_task_debug_required: bool,
}

impl NewTaskSpec {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

/// Decomposes a flow of one flow type into tasks.
#[async_trait]
pub trait FlowBuilder: Send + Sync {
    async fn build_tasks(
        &self,
        flow: &DynaFlow,
    ) -> std::result::Result<Vec<NewTaskSpec>, HandlerError>;
}

struct RegisteredTask {
    spec: TaskTypeSpec,
    handler: Arc<dyn TaskHandler>,
}

struct RegisteredFlow {
    spec: FlowTypeSpec,
    builder: Arc<dyn FlowBuilder>,
}

/// Name-keyed handler and builder registry.
#[derive(Default)]
pub struct FlowRegistry {
    tasks: HashMap<String, RegisteredTask>,
    flows: HashMap<String, RegisteredFlow>,
}

impl FlowRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in `Placeholder` types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::handlers::register_builtins(&mut registry);
        registry
    }

    /// Register a task handler under `spec.lookup_enum_name`.
    pub fn register_task(
        &mut self,
        spec: TaskTypeSpec,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<&mut Self> {
        if self.tasks.contains_key(&spec.lookup_enum_name) {
            return Err(Error::Registry(format!(
                "task type '{}' is already registered",
                spec.lookup_enum_name
            )));
        }
        self.tasks
            .insert(spec.lookup_enum_name.clone(), RegisteredTask { spec, handler });
        Ok(self)
    }

    /// Register a flow builder under `spec.lookup_enum_name`.
    pub fn register_flow(
        &mut self,
        spec: FlowTypeSpec,
        builder: Arc<dyn FlowBuilder>,
    ) -> Result<&mut Self> {
        if self.flows.contains_key(&spec.lookup_enum_name) {
            return Err(Error::Registry(format!(
                "flow type '{}' is already registered",
                spec.lookup_enum_name
            )));
        }
        self.flows
            .insert(spec.lookup_enum_name.clone(), RegisteredFlow { spec, builder });
        Ok(self)
    }

    /// Task type catalog, sorted by name.
    pub fn task_type_specs(&self) -> Vec<TaskTypeSpec> {
        let mut specs: Vec<TaskTypeSpec> = self.tasks.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.lookup_enum_name.cmp(&b.lookup_enum_name));
        specs
    }

    /// Flow type catalog, sorted by name.
    pub fn flow_type_specs(&self) -> Vec<FlowTypeSpec> {
        let mut specs: Vec<FlowTypeSpec> = self.flows.values().map(|f| f.spec.clone()).collect();
        specs.sort_by(|a, b| a.lookup_enum_name.cmp(&b.lookup_enum_name));
        specs
    }

    pub fn has_task_type(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Resolve and run the handler for `ctx.task_type`.
    pub async fn dispatch(&self, ctx: TaskContext) -> std::result::Result<TaskOutput, FailureKind> {
        let handler = self
            .tasks
            .get(&ctx.task_type)
            .map(|registered| registered.handler.clone())
            .ok_or_else(|| FailureKind::UnknownHandler(ctx.task_type.clone()))?;

        let joined = tokio::spawn(async move { handler.process(&ctx).await }).await;
        match joined {
            Ok(result) => result.map_err(FailureKind::Handler),
            Err(e) if e.is_panic() => Err(FailureKind::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(FailureKind::Panicked(e.to_string())),
        }
    }

    /// Resolve and run the builder for `flow_type`.
    pub async fn build(
        &self,
        flow_type: &str,
        flow: &DynaFlow,
    ) -> std::result::Result<Vec<NewTaskSpec>, FailureKind> {
        let builder = self
            .flows
            .get(flow_type)
            .map(|registered| registered.builder.clone())
            .ok_or_else(|| FailureKind::UnknownHandler(flow_type.to_string()))?;

        let flow = flow.clone();
        let joined = tokio::spawn(async move { builder.build_tasks(&flow).await }).await;
        match joined {
            Ok(result) => result.map_err(FailureKind::Handler),
            Err(e) if e.is_panic() => Err(FailureKind::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(FailureKind::Panicked(e.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
