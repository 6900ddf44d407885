// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow manager: the application-facing API over the task store.
//!
//! The surrounding application submits flows, requests cancellation and
//! pauses the scheduled sweep through this type. Workers never call it on
//! their hot path; they drive the store directly through sessions.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::persistence::{
    DynaFlow, DynaFlowTask, DynaFlowTypeSchedule, FlowTypeSpec, NewDynaFlow, NewSchedule, Pac,
    RecordKey, TaskStore, TaskTypeSpec,
};

/// Request to create a new flow.
#[derive(Debug, Clone, Default)]
pub struct FlowRequest {
    /// Flow type name (`lookup_enum_name` of the catalog row).
    pub flow_type: String,
    /// Parent flow code, for sub-flows.
    pub parent_code: Option<String>,
    /// Flow that must complete before this one is built.
    pub dependency_code: Option<String>,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub param: Option<String>,
    pub subject_code: Option<String>,
    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,
}

impl FlowRequest {
    /// Request a flow of the given type with default settings.
    pub fn new(flow_type: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            ..Default::default()
        }
    }
}

/// A flow together with its tasks.
#[derive(Debug, Clone)]
pub struct FlowStatus {
    pub flow: DynaFlow,
    pub tasks: Vec<DynaFlowTask>,
}

/// Application-facing operations over one partition.
#[derive(Clone)]
pub struct FlowManager {
    store: Arc<dyn TaskStore>,
    pac_id: i64,
}

impl FlowManager {
    /// Create a manager for an already bootstrapped partition.
    pub fn new(store: Arc<dyn TaskStore>, pac_id: i64) -> Self {
        Self { store, pac_id }
    }

    /// Upsert the partition, the type catalogs and the maintenance row.
    ///
    /// Safe to call on every start; existing rows keep their ids.
    pub async fn bootstrap(
        store: Arc<dyn TaskStore>,
        pac_code: &str,
        task_types: &[TaskTypeSpec],
        flow_types: &[FlowTypeSpec],
    ) -> Result<(Self, Pac), StoreError> {
        let mut uow = store.begin().await?;
        let pac = uow.upsert_pac(pac_code, pac_code).await?;
        for spec in task_types {
            uow.upsert_task_type(pac.id, spec).await?;
        }
        for spec in flow_types {
            uow.upsert_flow_type(pac.id, spec).await?;
        }
        uow.get_or_create_maintenance(pac.id).await?;
        uow.commit().await?;

        info!(
            pac = %pac.code,
            task_types = task_types.len(),
            flow_types = flow_types.len(),
            "Catalogs bootstrapped"
        );

        Ok((Self::new(store, pac.id), pac))
    }

    pub fn pac_id(&self) -> i64 {
        self.pac_id
    }

    /// Create a new flow. Priority comes from the flow type.
    pub async fn submit_flow(&self, request: FlowRequest) -> Result<DynaFlow, StoreError> {
        let mut uow = self.store.begin().await?;

        let flow_type = uow
            .find_flow_type(self.pac_id, &request.flow_type)
            .await?
            .ok_or_else(|| StoreError::not_found("flow type", &request.flow_type))?;

        let (parent_id, root_id) = match &request.parent_code {
            Some(code) => {
                let parent = uow
                    .load_flow(RecordKey::Code(code))
                    .await?
                    .ok_or_else(|| StoreError::not_found("flow", code))?;
                (Some(parent.id), Some(parent.root_dyna_flow_id.unwrap_or(parent.id)))
            }
            None => (None, None),
        };

        let dependency_id = match &request.dependency_code {
            Some(code) => Some(
                uow.load_flow(RecordKey::Code(code))
                    .await?
                    .ok_or_else(|| StoreError::not_found("flow", code))?
                    .id,
            ),
            None => None,
        };

        let flow = uow
            .insert_flow(&NewDynaFlow {
                dyna_flow_type_id: flow_type.id,
                pac_id: self.pac_id,
                parent_dyna_flow_id: parent_id,
                root_dyna_flow_id: root_id,
                dependency_dyna_flow_id: dependency_id,
                priority_level: flow_type.priority_level,
                min_start_utc_date_time: request.min_start_utc_date_time,
                is_build_task_debug_required: request.is_build_task_debug_required,
                is_run_task_debug_required: request.is_run_task_debug_required,
                param: request.param,
                subject_code: request.subject_code,
            })
            .await?;
        uow.commit().await?;

        info!(flow_code = %flow.code, flow_type = %flow_type.lookup_enum_name, "Flow submitted");
        Ok(flow)
    }

    /// Request cancellation of a flow and every descendant flow.
    ///
    /// Flows already completed are left alone. Returns the number of flows
    /// newly marked. Workers cancel the remaining tasks as they reach them.
    pub async fn request_cancel(&self, flow_code: &str) -> Result<usize, StoreError> {
        let mut uow = self.store.begin().await?;

        let root = uow
            .load_flow(RecordKey::Code(flow_code))
            .await?
            .ok_or_else(|| StoreError::not_found("flow", flow_code))?;

        let mut marked = 0;
        let mut pending = VecDeque::from([root.id]);
        while let Some(id) = pending.pop_front() {
            let Some(mut flow) = uow.lock_flow(id).await? else {
                continue;
            };
            if !flow.is_completed && !flow.is_cancel_requested {
                flow.is_cancel_requested = true;
                uow.save_flow(&flow).await?;
                marked += 1;
            }
            for child in uow.list_child_flows(id).await? {
                pending.push_back(child.id);
            }
        }
        uow.commit().await?;

        info!(flow_code = %flow_code, marked, "Cancellation requested");
        Ok(marked)
    }

    /// Load a flow and its tasks by code.
    pub async fn flow_status(&self, flow_code: &str) -> Result<Option<FlowStatus>, StoreError> {
        let mut uow = self.store.begin().await?;
        let Some(flow) = uow.load_flow(RecordKey::Code(flow_code)).await? else {
            return Ok(None);
        };
        let tasks = uow.list_flow_tasks(flow.id).await?;
        Ok(Some(FlowStatus { flow, tasks }))
    }

    /// Stop the master role from claiming the scheduled sweep.
    pub async fn pause_scheduled_processing(&self, username: &str) -> Result<(), StoreError> {
        let mut uow = self.store.begin().await?;
        let mut maintenance = uow.get_or_create_maintenance(self.pac_id).await?;
        maintenance.is_paused = true;
        maintenance.paused_by_username = username.to_string();
        maintenance.paused_utc_date_time = Some(Utc::now());
        uow.save_maintenance(&maintenance).await?;
        uow.commit().await?;

        info!(username = %username, "Scheduled processing paused");
        Ok(())
    }

    pub async fn resume_scheduled_processing(&self) -> Result<(), StoreError> {
        let mut uow = self.store.begin().await?;
        let mut maintenance = uow.get_or_create_maintenance(self.pac_id).await?;
        maintenance.is_paused = false;
        maintenance.paused_by_username.clear();
        maintenance.paused_utc_date_time = None;
        uow.save_maintenance(&maintenance).await?;
        uow.commit().await?;

        info!("Scheduled processing resumed");
        Ok(())
    }

    /// Register a recurring flow request. The first run is due at `first_run`.
    pub async fn add_schedule(
        &self,
        flow_type: &str,
        frequency_in_hours: i32,
        first_run: DateTime<Utc>,
    ) -> Result<DynaFlowTypeSchedule, StoreError> {
        let mut uow = self.store.begin().await?;
        let flow_type_row = uow
            .find_flow_type(self.pac_id, flow_type)
            .await?
            .ok_or_else(|| StoreError::not_found("flow type", flow_type))?;
        let schedule = uow
            .insert_schedule(&NewSchedule {
                pac_id: self.pac_id,
                dyna_flow_type_id: flow_type_row.id,
                frequency_in_hours,
                next_utc_date_time: Some(first_run),
            })
            .await?;
        uow.commit().await?;

        debug!(schedule_id = schedule.id, flow_type = %flow_type, "Schedule added");
        Ok(schedule)
    }
}
