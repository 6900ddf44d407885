// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master role: scheduled sweep, flow task builds and queue serving.
//!
//! One [`MasterRole::sweep`] runs, in order:
//!
//! 1. The maintenance claim. At most one master per partition runs the
//!    scheduled part of a sweep, gated by the `DfMaintenance` row.
//! 2. Scheduled requests, only when the claim was won. These reset
//!    abandoned claims older than the TTL, submit flows for due schedules,
//!    and schedule the next sweep.
//! 3. Flow task builds for every buildable flow.
//! 4. In queue mode, claiming runnable tasks and sending them to the
//!    processor queue, then draining the result queue.
//!
//! Each step logs its own failures so a broken step never stops the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dynaflow_core::{
    BuildTodoFilter, FlowRef, NewDynaFlow, NewDynaFlowTask, PriorityOrder, RecordKey,
    RunTodoFilter, StoreError, TaskStore,
};
use tracing::{debug, error, info, warn};

use crate::claim::ClaimProtocol;
use crate::config::QueueNames;
use crate::error::Result;
use crate::queue::{MessageQueue, TaskMessage, TaskResultMessage};
use crate::registry::FlowRegistry;
use crate::retry::{FlowTransition, apply_flow_transition};

/// Configuration for the master role.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Gap between two scheduled sweeps.
    pub sweep_interval: Duration,
    /// A started, uncompleted sweep older than this no longer blocks a new one.
    pub sweep_stale_after: Duration,
    /// Build and run claims older than this are reset by the scheduled sweep.
    pub abandoned_claim_ttl: Duration,
    /// Upper bound on rows fetched per to-do list.
    pub batch_size: i64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30 * 60),
            sweep_stale_after: Duration::from_secs(24 * 3600),
            abandoned_claim_ttl: Duration::from_secs(2 * 3600),
            batch_size: 100,
        }
    }
}

/// Counters for one master sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sweep_claimed: bool,
    pub flow_builds_reset: usize,
    pub task_runs_reset: usize,
    pub scheduled_flows: usize,
    pub build_todo: usize,
    pub flows_built: usize,
    pub flows_canceled: usize,
    pub build_failures: usize,
    pub build_conflicts: usize,
    pub tasks_queued: usize,
    pub results_drained: usize,
}

/// Result of building one claimed flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Tasks were inserted. A flow with zero tasks is completed at once.
    Built { task_count: usize },
    /// The flow was cancel-requested and has been canceled.
    Canceled,
    /// The builder failed; the flow is completed unsuccessfully.
    Failed { error: String },
}

/// Master role for one partition.
pub struct MasterRole {
    store: Arc<dyn TaskStore>,
    registry: Arc<FlowRegistry>,
    claims: ClaimProtocol,
    pac_id: i64,
    config: MasterConfig,
}

impl MasterRole {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<FlowRegistry>,
        claims: ClaimProtocol,
        pac_id: i64,
        config: MasterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            claims,
            pac_id,
            config,
        }
    }

    pub fn owner(&self) -> &str {
        self.claims.owner()
    }

    /// Run one full master sweep. `queue` is set in queue mode.
    pub async fn sweep(&self, queue: Option<(&dyn MessageQueue, &QueueNames)>) -> SweepReport {
        let mut report = SweepReport::default();

        if self.claim_maintenance().await {
            report.sweep_claimed = true;
            if let Err(e) = self.request_scheduled_flows(&mut report).await {
                error!(error = %e, "Scheduled flow request failed");
            }
        }

        if let Err(e) = self.build_flow_tasks(&mut report).await {
            error!(error = %e, "Flow task build pass failed");
        }

        if let Some((queue, names)) = queue {
            match self.serve_tasks(queue, names).await {
                Ok(sent) => report.tasks_queued = sent,
                Err(e) => error!(error = %e, "Serving tasks to the processor queue failed"),
            }
            match self.drain_results(queue, names).await {
                Ok(drained) => report.results_drained = drained,
                Err(e) => error!(error = %e, "Draining the result queue failed"),
            }
        }

        report
    }

    /// Try to take the partition's scheduled sweep.
    ///
    /// Abstains while paused, while another sweep started within
    /// `sweep_stale_after` is still running, or before the next scheduled
    /// time. Persistence failures count as a lost claim.
    pub async fn claim_maintenance(&self) -> bool {
        match self.try_claim_maintenance().await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(owner = %self.owner(), error = %e, "Maintenance claim failed");
                false
            }
        }
    }

    async fn try_claim_maintenance(&self) -> Result<bool> {
        let now = Utc::now();
        let mut uow = self.store.begin().await?;
        let mut maintenance = uow.get_or_create_maintenance(self.pac_id).await?;

        let running_since = shift_back(now, self.config.sweep_stale_after);
        let abstain = if maintenance.is_paused {
            Some("paused")
        } else if maintenance.is_scheduled_df_process_request_started
            && !maintenance.is_scheduled_df_process_request_completed
            && maintenance
                .last_scheduled_df_process_request_utc_date_time
                .is_some_and(|last| last > running_since)
        {
            Some("another sweep is running")
        } else if maintenance
            .next_scheduled_df_process_request_utc_date_time
            .is_some_and(|next| next > now)
        {
            Some("not due")
        } else {
            None
        };

        if let Some(reason) = abstain {
            uow.rollback().await?;
            debug!(reason, "Scheduled sweep skipped");
            return Ok(false);
        }

        maintenance.is_scheduled_df_process_request_started = true;
        maintenance.is_scheduled_df_process_request_completed = false;
        maintenance.scheduled_df_process_request_processor_identifier = self.owner().to_string();
        maintenance.last_scheduled_df_process_request_utc_date_time = Some(now);
        uow.save_maintenance(&maintenance).await?;
        uow.commit().await?;

        info!(owner = %self.owner(), "Scheduled sweep claimed");
        Ok(true)
    }

    /// Reset abandoned claims, submit due scheduled flows and mark the sweep
    /// completed.
    async fn request_scheduled_flows(&self, report: &mut SweepReport) -> Result<()> {
        let now = Utc::now();
        let claimed_before = shift_back(now, self.config.abandoned_claim_ttl);

        let mut uow = self.store.begin().await?;
        for mut flow in uow
            .get_abandoned_flow_builds(self.pac_id, claimed_before)
            .await?
        {
            warn!(flow_id = flow.id, owner = %flow.task_creation_processor_identifier, "Resetting abandoned flow build");
            flow.is_task_creation_started = false;
            flow.task_creation_processor_identifier.clear();
            flow.task_creation_started_utc_date_time = None;
            flow.is_started = false;
            uow.save_flow(&flow).await?;
            report.flow_builds_reset += 1;
        }
        for mut task in uow.get_abandoned_tasks(self.pac_id, claimed_before).await? {
            warn!(task_id = task.id, owner = %task.processor_identifier, "Resetting abandoned task run");
            task.processor_identifier.clear();
            task.is_started = false;
            uow.save_task(&task).await?;
            report.task_runs_reset += 1;
        }

        for mut schedule in uow.get_due_schedules(self.pac_id, now).await? {
            let flow_type = uow
                .get_flow_type(schedule.dyna_flow_type_id)
                .await?
                .ok_or_else(|| StoreError::not_found("flow type", schedule.dyna_flow_type_id))?;
            let flow = uow
                .insert_flow(&NewDynaFlow {
                    dyna_flow_type_id: flow_type.id,
                    pac_id: self.pac_id,
                    priority_level: flow_type.priority_level,
                    ..Default::default()
                })
                .await?;

            let hours = i64::from(schedule.frequency_in_hours.max(1));
            schedule.last_utc_date_time = Some(now);
            schedule.next_utc_date_time = Some(shift_forward(
                now,
                Duration::from_secs(hours.unsigned_abs() * 3600),
            ));
            uow.save_schedule(&schedule).await?;
            report.scheduled_flows += 1;

            info!(
                schedule_id = schedule.id,
                flow_code = %flow.code,
                flow_type = %flow_type.lookup_enum_name,
                "Scheduled flow requested"
            );
        }

        let mut maintenance = uow.get_or_create_maintenance(self.pac_id).await?;
        maintenance.is_scheduled_df_process_request_completed = true;
        maintenance.next_scheduled_df_process_request_utc_date_time =
            Some(shift_forward(now, self.config.sweep_interval));
        uow.save_maintenance(&maintenance).await?;
        uow.commit().await?;

        Ok(())
    }

    /// Number of flows currently waiting for a task build.
    pub async fn build_todo_count(&self) -> Result<usize> {
        Ok(self.build_todo_list().await?.len())
    }

    async fn build_flow_tasks(&self, report: &mut SweepReport) -> Result<()> {
        let todo = self.build_todo_list().await?;
        report.build_todo = todo.len();

        for flow_ref in todo {
            if !self.claims.claim_flow_for_build(flow_ref.flow_id).await.is_owned() {
                report.build_conflicts += 1;
                continue;
            }

            match self.build_flow(&flow_ref).await {
                Ok(BuildOutcome::Built { .. }) => report.flows_built += 1,
                Ok(BuildOutcome::Canceled) => report.flows_canceled += 1,
                Ok(BuildOutcome::Failed { .. }) => report.build_failures += 1,
                Err(e) => {
                    error!(flow_id = flow_ref.flow_id, error = %e, "Flow build could not be recorded");
                    report.build_failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Build the tasks of a flow whose build claim this processor holds.
    pub async fn build_flow(&self, flow_ref: &FlowRef) -> Result<BuildOutcome> {
        let now = Utc::now();

        let flow = {
            let mut uow = self.store.begin().await?;
            let mut flow = uow
                .lock_flow(flow_ref.flow_id)
                .await?
                .ok_or_else(|| StoreError::not_found("flow", flow_ref.flow_id))?;

            if flow.is_cancel_requested {
                apply_flow_transition(&mut flow, FlowTransition::Canceled, now);
                uow.save_flow(&flow).await?;
                uow.commit().await?;
                info!(flow_id = flow.id, flow_code = %flow.code, "Flow canceled before build");
                return Ok(BuildOutcome::Canceled);
            }
            uow.commit().await?;
            flow
        };

        let specs = match self.registry.build(&flow_ref.flow_type_name, &flow).await {
            Ok(specs) => specs,
            Err(failure) => {
                let error = failure.to_string();
                self.fail_build(flow.id, &error).await?;
                return Ok(BuildOutcome::Failed { error });
            }
        };

        let mut uow = self.store.begin().await?;
        let mut flow = uow
            .lock_flow(flow.id)
            .await?
            .ok_or_else(|| StoreError::not_found("flow", flow.id))?;

        let mut resolved = Vec::with_capacity(specs.len());
        for spec in &specs {
            match uow.find_task_type(self.pac_id, &spec.task_type).await? {
                Some(task_type) => resolved.push((spec, task_type)),
                None => {
                    uow.rollback().await?;
                    let error = format!("unknown task type '{}'", spec.task_type);
                    self.fail_build(flow.id, &error).await?;
                    return Ok(BuildOutcome::Failed { error });
                }
            }
        }

        for (spec, task_type) in &resolved {
            uow.insert_task(&NewDynaFlowTask {
                dyna_flow_id: flow.id,
                dyna_flow_task_type_id: task_type.id,
                max_retry_count: task_type.max_retry_count,
                min_start_utc_date_time: spec.min_start_utc_date_time,
                is_run_task_debug_required: spec.is_run_task_debug_required,
                param: spec.param.clone(),
            })
            .await?;
        }

        flow.is_tasks_created = true;
        if resolved.is_empty() {
            apply_flow_transition(&mut flow, FlowTransition::Completed { successful: true }, now);
        }
        uow.save_flow(&flow).await?;
        uow.commit().await?;

        info!(
            flow_id = flow.id,
            flow_code = %flow.code,
            task_count = resolved.len(),
            "Flow tasks built"
        );
        Ok(BuildOutcome::Built {
            task_count: resolved.len(),
        })
    }

    async fn fail_build(&self, flow_id: i64, error: &str) -> Result<()> {
        let mut uow = self.store.begin().await?;
        let mut flow = uow
            .lock_flow(flow_id)
            .await?
            .ok_or_else(|| StoreError::not_found("flow", flow_id))?;
        apply_flow_transition(
            &mut flow,
            FlowTransition::Completed { successful: false },
            Utc::now(),
        );
        uow.save_flow(&flow).await?;
        uow.commit().await?;

        warn!(flow_id, error = %error, "Flow build failed, flow completed unsuccessfully");
        Ok(())
    }

    /// Claim every runnable task and send it to the processor queue.
    async fn serve_tasks(&self, queue: &dyn MessageQueue, names: &QueueNames) -> Result<usize> {
        let todo = {
            let mut uow = self.store.begin().await?;
            let todo = uow
                .get_run_todo_list(&RunTodoFilter {
                    pac_id: self.pac_id,
                    now: Utc::now(),
                    priority_order: PriorityOrder::HighestFirst,
                    exclude_debug: true,
                    limit: self.config.batch_size,
                })
                .await?;
            uow.commit().await?;
            todo
        };

        let mut sent = 0;
        for task_ref in &todo {
            if !self.claims.claim_task(task_ref.task_id).await.is_owned() {
                continue;
            }
            let claimed = {
                let mut uow = self.store.begin().await?;
                let task = uow
                    .load_task(RecordKey::Id(task_ref.task_id))
                    .await?
                    .ok_or_else(|| StoreError::not_found("task", task_ref.task_id))?;
                uow.commit().await?;
                task
            };
            let body = serde_json::to_string(&TaskMessage::claimed(task_ref, &claimed))?;
            queue.send(&names.processor, &body).await?;
            sent += 1;
            debug!(task_id = task_ref.task_id, "Task sent to the processor queue");
        }

        if sent > 0 {
            info!(sent, queue = %names.processor, "Tasks queued");
        }
        Ok(sent)
    }

    /// Read and discard result messages. The store already holds the outcome.
    async fn drain_results(&self, queue: &dyn MessageQueue, names: &QueueNames) -> Result<usize> {
        let mut drained = 0;
        while let Some(message) = queue.read_next(&names.result).await? {
            match serde_json::from_str::<TaskResultMessage>(&message.body) {
                Ok(result) => debug!(
                    task_code = %result.task_code,
                    is_successful = result.is_successful,
                    "Task result drained"
                ),
                Err(e) => warn!(message_id = %message.message_id, error = %e, "Unreadable result message drained"),
            }
            queue.complete(&names.result, &message).await?;
            drained += 1;
        }
        Ok(drained)
    }

    async fn build_todo_list(&self) -> Result<Vec<FlowRef>> {
        let mut uow = self.store.begin().await?;
        let todo = uow
            .get_build_todo_list(&BuildTodoFilter {
                pac_id: self.pac_id,
                now: Utc::now(),
                priority_order: PriorityOrder::HighestFirst,
                exclude_debug: true,
                limit: self.config.batch_size,
            })
            .await?;
        uow.commit().await?;
        Ok(todo)
    }
}

fn shift_back(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn shift_forward(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
