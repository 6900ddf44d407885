// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry and completion policy.
//!
//! Pure functions over records: [`RetryPolicy::decide`] turns a dispatch
//! outcome into a [`TaskTransition`], [`RetryPolicy::apply`] writes it onto
//! the task, and [`evaluate_flow`] decides whether a flow is finished once its
//! tasks have moved. Callers persist the mutated records in their own unit of
//! work.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dynaflow_core::{DynaFlow, DynaFlowTask};

use crate::registry::{FailureKind, TaskOutput};

/// What happens to a task after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    /// Handler succeeded; the task is complete.
    Succeeded { result_value: Option<String> },
    /// Handler failed with retries left; the task returns to the pool.
    Retry {
        retry_count: i32,
        min_start: DateTime<Utc>,
        error: String,
    },
    /// Handler failed with no retries left; the task is complete and unsuccessful.
    Exhausted { error: String },
}

impl TaskTransition {
    /// True when the task will not run again.
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskTransition::Retry { .. })
    }
}

/// Flat-backoff retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }

    /// Decide the transition for a claimed task given its dispatch outcome.
    pub fn decide(
        &self,
        task: &DynaFlowTask,
        outcome: &Result<TaskOutput, FailureKind>,
        now: DateTime<Utc>,
    ) -> TaskTransition {
        match outcome {
            Ok(output) => TaskTransition::Succeeded {
                result_value: output.result_value.clone(),
            },
            Err(failure) if task.retry_count >= task.max_retry_count => TaskTransition::Exhausted {
                error: failure.to_string(),
            },
            Err(failure) => TaskTransition::Retry {
                retry_count: task.retry_count + 1,
                min_start: self.next_attempt_at(now),
                error: failure.to_string(),
            },
        }
    }

    /// Write a transition onto the task record.
    pub fn apply(&self, task: &mut DynaFlowTask, transition: &TaskTransition, now: DateTime<Utc>) {
        match transition {
            TaskTransition::Succeeded { result_value } => {
                task.is_successful = true;
                task.is_completed = true;
                task.completed_utc_date_time = Some(now);
                task.result_value = result_value.clone();
                task.last_error = None;
            }
            TaskTransition::Retry {
                retry_count,
                min_start,
                error,
            } => {
                task.retry_count = *retry_count;
                task.processor_identifier.clear();
                task.is_started = false;
                task.is_completed = false;
                task.min_start_utc_date_time = Some(*min_start);
                task.last_error = Some(error.clone());
            }
            TaskTransition::Exhausted { error } => {
                // Owner is kept so operators can see which worker gave up.
                task.is_successful = false;
                task.is_completed = true;
                task.completed_utc_date_time = Some(now);
                task.last_error = Some(error.clone());
            }
        }
    }

    /// Earliest time a failed task may be claimed again.
    pub fn next_attempt_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.backoff)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Mark a task canceled without running it.
pub fn cancel_task(task: &mut DynaFlowTask, now: DateTime<Utc>) {
    task.is_canceled = true;
    task.is_completed = true;
    task.is_successful = false;
    task.completed_utc_date_time = Some(now);
}

/// What happens to a flow after one of its tasks moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTransition {
    Unchanged,
    Completed { successful: bool },
    Canceled,
}

/// Decide whether a flow is finished given the current state of its tasks.
pub fn evaluate_flow(flow: &DynaFlow, tasks: &[DynaFlowTask]) -> FlowTransition {
    if flow.is_completed {
        return FlowTransition::Unchanged;
    }

    let any_live = tasks.iter().any(|t| !t.is_terminal());

    if flow.is_cancel_requested {
        return if any_live {
            FlowTransition::Unchanged
        } else {
            FlowTransition::Canceled
        };
    }

    if flow.is_tasks_created && !tasks.is_empty() && !any_live {
        return FlowTransition::Completed {
            successful: tasks.iter().all(|t| t.is_successful),
        };
    }

    FlowTransition::Unchanged
}

/// Write a flow transition onto the flow record.
pub fn apply_flow_transition(flow: &mut DynaFlow, transition: FlowTransition, now: DateTime<Utc>) {
    match transition {
        FlowTransition::Unchanged => {}
        FlowTransition::Completed { successful } => {
            flow.is_completed = true;
            flow.is_successful = successful;
            flow.completed_utc_date_time = Some(now);
        }
        FlowTransition::Canceled => {
            flow.is_canceled = true;
            flow.is_completed = true;
            flow.is_successful = false;
            flow.completed_utc_date_time = Some(now);
        }
    }
}
