// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task-runner role.
//!
//! Executing a claimed task takes three steps, each with its own session:
//!
//! 1. **Prepare**: check the parent flow. A closed flow skips the task, a
//!    cancel-requested flow cancels it. Otherwise the flow is marked started.
//! 2. **Dispatch**: run the handler with no session open.
//! 3. **Record**: apply the retry policy to the task and re-evaluate the flow.
//!
//! Tasks reach the runner either by polling the run to-do list or by
//! consuming the processor queue filled by the master role.

use std::sync::Arc;

use chrono::Utc;
use dynaflow_core::{
    DynaFlowTask, PriorityOrder, RecordKey, RunTodoFilter, StoreError, TaskRef, TaskStore,
};
use tracing::{debug, error, info, warn};

use crate::claim::ClaimProtocol;
use crate::config::QueueNames;
use crate::error::Result;
use crate::queue::{MessageQueue, QueueMessage, TaskMessage, TaskResultMessage};
use crate::registry::{FailureKind, FlowRegistry, TaskContext, TaskOutput};
use crate::retry::{
    FlowTransition, RetryPolicy, TaskTransition, apply_flow_transition, cancel_task, evaluate_flow,
};

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The parent flow is already completed; the handler was not run.
    FlowClosed,
    /// The task is not started under this processor's identifier.
    NotOwned,
    /// A queue message whose claim was already taken over, reset or finished.
    StaleMessage,
    /// The parent flow requested cancellation; the task was canceled.
    Canceled(DynaFlowTask),
    /// The handler ran and the retry policy recorded the result.
    Finished {
        task: DynaFlowTask,
        transition: TaskTransition,
    },
}

impl RunOutcome {
    /// The task row when the task will not run again.
    pub fn final_task(&self) -> Option<&DynaFlowTask> {
        match self {
            RunOutcome::Canceled(task) => Some(task),
            RunOutcome::Finished { task, transition } if transition.is_final() => Some(task),
            _ => None,
        }
    }
}

/// Counters for one runner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerReport {
    /// Tasks found on the run to-do list or messages read from the queue.
    pub todo: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub canceled: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub dead_lettered: usize,
}

impl RunnerReport {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::FlowClosed | RunOutcome::NotOwned | RunOutcome::StaleMessage => {
                self.skipped += 1
            }
            RunOutcome::Canceled(_) => self.canceled += 1,
            RunOutcome::Finished { transition, .. } => match transition {
                TaskTransition::Succeeded { .. } => self.succeeded += 1,
                TaskTransition::Retry { .. } => self.retried += 1,
                TaskTransition::Exhausted { .. } => self.exhausted += 1,
            },
        }
    }
}

/// Claims and executes tasks for one partition.
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    registry: Arc<FlowRegistry>,
    claims: ClaimProtocol,
    policy: RetryPolicy,
    pac_id: i64,
    batch_size: i64,
}

enum Prepared {
    Done(RunOutcome),
    Dispatch(TaskContext),
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<FlowRegistry>,
        claims: ClaimProtocol,
        policy: RetryPolicy,
        pac_id: i64,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            registry,
            claims,
            policy,
            pac_id,
            batch_size,
        }
    }

    pub fn owner(&self) -> &str {
        self.claims.owner()
    }

    /// Number of tasks currently eligible to run.
    pub async fn run_todo_count(&self) -> Result<usize> {
        Ok(self.run_todo_list().await?.len())
    }

    /// DB-poll mode: claim and execute every task on the run to-do list.
    ///
    /// Claim conflicts and persistence failures are counted and skipped. A
    /// to-do list that cannot be read ends the pass with one error counted.
    pub async fn poll_once(&self) -> RunnerReport {
        let mut report = RunnerReport::default();
        let todo = match self.run_todo_list().await {
            Ok(todo) => todo,
            Err(e) => {
                error!(error = %e, "Reading the run to-do list failed");
                report.errors += 1;
                return report;
            }
        };
        report.todo = todo.len();

        for task_ref in todo {
            if !self.claims.claim_task(task_ref.task_id).await.is_owned() {
                report.conflicts += 1;
                continue;
            }

            match self.execute(task_ref.task_id).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(task_id = task_ref.task_id, error = %e, "Task execution failed");
                    report.errors += 1;
                }
            }
        }

        if report.todo > 0 {
            info!(
                todo = report.todo,
                succeeded = report.succeeded,
                retried = report.retried,
                exhausted = report.exhausted,
                canceled = report.canceled,
                conflicts = report.conflicts,
                "Run to-do list processed"
            );
        }
        report
    }

    /// Queue-consume mode: process processor-queue messages until the queue
    /// is empty or a batch has been read.
    ///
    /// A message that cannot be handled is copied to the dead-letter queue.
    /// Every read message is completed, handled or not. Final task states
    /// are published to the result queue. A failed read ends the pass.
    pub async fn consume_queue(&self, queue: &dyn MessageQueue, names: &QueueNames) -> RunnerReport {
        let mut report = RunnerReport::default();

        while (report.todo as i64) < self.batch_size {
            let message = match queue.read_next(&names.processor).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    error!(queue = %names.processor, error = %e, "Reading the processor queue failed");
                    report.errors += 1;
                    break;
                }
            };
            report.todo += 1;

            match self.handle_message(queue, names, &message).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Message handling failed, dead-lettering"
                    );
                    report.errors += 1;
                    match queue.send(&names.dead_letter, &message.body).await {
                        Ok(()) => report.dead_lettered += 1,
                        Err(e) => {
                            error!(message_id = %message.message_id, error = %e, "Dead-letter send failed")
                        }
                    }
                }
            }

            if let Err(e) = queue.complete(&names.processor, &message).await {
                error!(message_id = %message.message_id, error = %e, "Message completion failed");
            }
        }

        report
    }

    async fn handle_message(
        &self,
        queue: &dyn MessageQueue,
        names: &QueueNames,
        message: &QueueMessage,
    ) -> Result<RunOutcome> {
        let task_message: TaskMessage = serde_json::from_str(&message.body)?;
        let Some(task_id) = self.take_over(&task_message).await? else {
            return Ok(RunOutcome::StaleMessage);
        };

        let outcome = self.execute(task_id).await?;
        if let Some(task) = outcome.final_task() {
            let body = serde_json::to_string(&TaskResultMessage::from(task))?;
            queue.send(&names.result, &body).await?;
        }
        Ok(outcome)
    }

    /// Take over a task delivered by the queue: the master claimed it, this
    /// processor runs it.
    ///
    /// The row must still carry the exact claim recorded in the message.
    /// Taking over restamps the claim time, so a redelivered or duplicated
    /// message for the same claim finds it gone and returns `None`, as does
    /// a message for a task that went back to the pool or was completed.
    async fn take_over(&self, message: &TaskMessage) -> Result<Option<i64>> {
        let mut uow = self.store.begin().await?;
        let task = uow
            .load_task(RecordKey::Code(&message.task_code))
            .await?
            .ok_or_else(|| StoreError::not_found("task", &message.task_code))?;
        let mut task = uow
            .lock_task(task.id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", &message.task_code))?;

        let current = task.is_started
            && !task.is_terminal()
            && task.processor_identifier == message.claimed_by
            && task.started_utc_date_time == message.claimed_at;
        if !current {
            uow.rollback().await?;
            debug!(
                task_id = task.id,
                task_code = %task.code,
                owner = %task.processor_identifier,
                is_started = task.is_started,
                "Queued claim is no longer current, skipping message"
            );
            return Ok(None);
        }

        task.processor_identifier = self.owner().to_string();
        task.started_utc_date_time = Some(Utc::now());
        uow.save_task(&task).await?;
        uow.commit().await?;

        debug!(task_id = task.id, task_code = %task.code, "Queued task taken over");
        Ok(Some(task.id))
    }

    /// Execute a task this processor has already claimed.
    pub async fn execute(&self, task_id: i64) -> Result<RunOutcome> {
        let ctx = match self.prepare(task_id).await? {
            Prepared::Done(outcome) => return Ok(outcome),
            Prepared::Dispatch(ctx) => ctx,
        };

        debug!(task_id, task_type = %ctx.task_type, "Dispatching task");
        let outcome = self.registry.dispatch(ctx).await;
        if let Err(failure) = &outcome {
            warn!(task_id, error = %failure, "Task handler failed");
        }

        self.record(task_id, outcome).await
    }

    async fn prepare(&self, task_id: i64) -> Result<Prepared> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;

        let task = uow
            .lock_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        if !task.is_started || task.is_terminal() || task.processor_identifier != self.owner() {
            uow.rollback().await?;
            warn!(task_id, owner = %task.processor_identifier, "Task is not owned by this processor");
            return Ok(Prepared::Done(RunOutcome::NotOwned));
        }

        let mut flow = uow
            .lock_flow(task.dyna_flow_id)
            .await?
            .ok_or_else(|| StoreError::not_found("flow", task.dyna_flow_id))?;

        if flow.is_completed {
            uow.rollback().await?;
            debug!(task_id, flow_id = flow.id, "Flow already completed, skipping task");
            return Ok(Prepared::Done(RunOutcome::FlowClosed));
        }

        if !flow.is_started {
            flow.is_started = true;
            flow.started_utc_date_time = Some(now);
        }

        if flow.is_cancel_requested {
            let mut task = task;
            cancel_task(&mut task, now);
            uow.save_task(&task).await?;

            let tasks = uow.list_flow_tasks(flow.id).await?;
            let transition = evaluate_flow(&flow, &tasks);
            apply_flow_transition(&mut flow, transition, now);
            uow.save_flow(&flow).await?;
            uow.commit().await?;

            info!(task_id, flow_id = flow.id, flow_canceled = flow.is_canceled, "Task canceled");
            return Ok(Prepared::Done(RunOutcome::Canceled(task)));
        }

        uow.save_flow(&flow).await?;
        let task_type = uow
            .get_task_type(task.dyna_flow_task_type_id)
            .await?
            .map(|t| t.lookup_enum_name)
            .unwrap_or_default();
        uow.commit().await?;

        Ok(Prepared::Dispatch(TaskContext {
            task,
            flow,
            task_type,
            processor_identifier: self.owner().to_string(),
        }))
    }

    async fn record(
        &self,
        task_id: i64,
        outcome: std::result::Result<TaskOutput, FailureKind>,
    ) -> Result<RunOutcome> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;

        let mut task = uow
            .lock_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        let transition = self.policy.decide(&task, &outcome, now);
        self.policy.apply(&mut task, &transition, now);
        uow.save_task(&task).await?;

        if transition.is_final() {
            let mut flow = uow
                .lock_flow(task.dyna_flow_id)
                .await?
                .ok_or_else(|| StoreError::not_found("flow", task.dyna_flow_id))?;
            let tasks = uow.list_flow_tasks(flow.id).await?;
            let flow_transition = evaluate_flow(&flow, &tasks);
            if flow_transition != FlowTransition::Unchanged {
                apply_flow_transition(&mut flow, flow_transition, now);
                uow.save_flow(&flow).await?;
                info!(flow_id = flow.id, ?flow_transition, "Flow finished");
            }
        }
        uow.commit().await?;

        match &transition {
            TaskTransition::Succeeded { .. } => info!(task_id, "Task succeeded"),
            TaskTransition::Retry {
                retry_count,
                min_start,
                ..
            } => info!(task_id, retry_count, %min_start, "Task scheduled for retry"),
            TaskTransition::Exhausted { error } => {
                warn!(task_id, retry_count = task.retry_count, error = %error, "Task retries exhausted")
            }
        }

        Ok(RunOutcome::Finished { task, transition })
    }

    async fn run_todo_list(&self) -> Result<Vec<TaskRef>> {
        let mut uow = self.store.begin().await?;
        let todo = uow
            .get_run_todo_list(&RunTodoFilter {
                pac_id: self.pac_id,
                now: Utc::now(),
                priority_order: PriorityOrder::HighestFirst,
                exclude_debug: true,
                limit: self.batch_size,
            })
            .await?;
        uow.commit().await?;
        Ok(todo)
    }
}
