// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in `Placeholder` flow and task types.
//!
//! A `Placeholder` flow builds a single `Placeholder` task carrying the flow's
//! parameter, and the task echoes its parameter back as its result. They keep
//! a fresh deployment runnable end to end before any real handler exists.

use std::sync::Arc;

use async_trait::async_trait;
use dynaflow_core::{DynaFlow, FlowTypeSpec, TaskTypeSpec};
use tracing::debug;

use crate::registry::{
    FlowBuilder, FlowRegistry, HandlerError, NewTaskSpec, TaskContext, TaskHandler, TaskOutput,
};

pub const PLACEHOLDER: &str = "Placeholder";

pub struct PlaceholderTask;

#[async_trait]
impl TaskHandler for PlaceholderTask {
    async fn process(&self, ctx: &TaskContext) -> Result<TaskOutput, HandlerError> {
        debug!(task_code = %ctx.task.code, "Placeholder task ran");
        Ok(TaskOutput {
            result_value: ctx.task.param.clone(),
        })
    }
}

pub struct PlaceholderFlow;

#[async_trait]
impl FlowBuilder for PlaceholderFlow {
    async fn build_tasks(&self, flow: &DynaFlow) -> Result<Vec<NewTaskSpec>, HandlerError> {
        Ok(vec![NewTaskSpec {
            task_type: PLACEHOLDER.to_string(),
            param: flow.param.clone(),
            ..Default::default()
        }])
    }
}

pub(crate) fn register_builtins(registry: &mut FlowRegistry) {
    // A fresh registry cannot already hold these names.
    let _ = registry.register_task(
        TaskTypeSpec {
            lookup_enum_name: PLACEHOLDER.to_string(),
            description: "No-op task that echoes its parameter".to_string(),
            max_retry_count: 0,
        },
        Arc::new(PlaceholderTask),
    );
    let _ = registry.register_flow(
        FlowTypeSpec {
            lookup_enum_name: PLACEHOLDER.to_string(),
            description: "Single placeholder task".to_string(),
            priority_level: 0,
        },
        Arc::new(PlaceholderFlow),
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub fn sample_flow() -> DynaFlow {
        DynaFlow {
            id: 1,
            code: "flow".to_string(),
            dyna_flow_type_id: 1,
            pac_id: 1,
            parent_dyna_flow_id: None,
            root_dyna_flow_id: None,
            dependency_dyna_flow_id: None,
            priority_level: 0,
            requested_utc_date_time: Utc::now(),
            started_utc_date_time: None,
            completed_utc_date_time: None,
            min_start_utc_date_time: None,
            is_started: false,
            is_completed: false,
            is_successful: false,
            is_canceled: false,
            is_cancel_requested: false,
            is_paused: false,
            is_resubmitted: false,
            is_tasks_created: false,
            is_task_creation_started: false,
            is_build_task_debug_required: false,
            is_run_task_debug_required: false,
            task_creation_processor_identifier: String::new(),
            task_creation_started_utc_date_time: None,
            param: Some("{\"batch\":7}".to_string()),
            result_value: None,
            subject_code: None,
        }
    }

    #[tokio::test]
    async fn test_placeholder_flow_carries_param() {
        let tasks = PlaceholderFlow.build_tasks(&sample_flow()).await.unwrap();
        assert_eq!(
            tasks,
            vec![NewTaskSpec::new(PLACEHOLDER).with_param("{\"batch\":7}")]
        );
    }
}
