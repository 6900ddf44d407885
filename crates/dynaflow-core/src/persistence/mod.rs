// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task store for flows, tasks and their catalogs.
//!
//! The store is consumed through explicit units of work: [`TaskStore::begin`]
//! opens a [`StoreSession`] wrapping one database transaction. Changes become
//! visible only on [`StoreSession::commit`]; a session dropped without commit
//! is rolled back, so every exit path releases the transaction.
//!
//! Records are plain values. Mutate a loaded record and hand it back with the
//! matching `save_*` call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresTaskStore;
pub use sqlite::SqliteTaskStore;

// ============================================================================
// Record Types
// ============================================================================

/// Partition (tenant scope) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pac {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// Flow type catalog row, keyed by the builder name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DynaFlowType {
    pub id: i64,
    pub pac_id: i64,
    pub lookup_enum_name: String,
    pub description: String,
    pub priority_level: i32,
    pub is_active: bool,
}

/// Task type catalog row, keyed by the handler name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DynaFlowTaskType {
    pub id: i64,
    pub pac_id: i64,
    pub lookup_enum_name: String,
    pub description: String,
    pub max_retry_count: i32,
    pub is_active: bool,
}

/// One flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DynaFlow {
    pub id: i64,
    pub code: String,
    pub dyna_flow_type_id: i64,
    pub pac_id: i64,
    pub parent_dyna_flow_id: Option<i64>,
    pub root_dyna_flow_id: Option<i64>,
    pub dependency_dyna_flow_id: Option<i64>,
    pub priority_level: i32,
    pub requested_utc_date_time: DateTime<Utc>,
    pub started_utc_date_time: Option<DateTime<Utc>>,
    pub completed_utc_date_time: Option<DateTime<Utc>>,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub is_started: bool,
    pub is_completed: bool,
    pub is_successful: bool,
    pub is_canceled: bool,
    pub is_cancel_requested: bool,
    pub is_paused: bool,
    pub is_resubmitted: bool,
    pub is_tasks_created: bool,
    pub is_task_creation_started: bool,
    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,
    /// Owner of the task-build claim; empty when unclaimed.
    pub task_creation_processor_identifier: String,
    pub task_creation_started_utc_date_time: Option<DateTime<Utc>>,
    pub param: Option<String>,
    pub result_value: Option<String>,
    pub subject_code: Option<String>,
}

/// One executable task of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DynaFlowTask {
    pub id: i64,
    pub code: String,
    pub dyna_flow_id: i64,
    pub dyna_flow_task_type_id: i64,
    /// Owner of the run claim; empty when unclaimed.
    pub processor_identifier: String,
    pub retry_count: i32,
    pub max_retry_count: i32,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub requested_utc_date_time: DateTime<Utc>,
    pub started_utc_date_time: Option<DateTime<Utc>>,
    pub completed_utc_date_time: Option<DateTime<Utc>>,
    pub is_started: bool,
    pub is_completed: bool,
    pub is_successful: bool,
    pub is_canceled: bool,
    pub is_run_task_debug_required: bool,
    pub param: Option<String>,
    pub result_value: Option<String>,
    /// Failure message of the most recent attempt.
    pub last_error: Option<String>,
}

impl DynaFlowTask {
    /// Terminal tasks are never claimed or run again.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_canceled
    }
}

/// Recurring flow request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DynaFlowTypeSchedule {
    pub id: i64,
    pub pac_id: i64,
    pub dyna_flow_type_id: i64,
    pub frequency_in_hours: i32,
    pub last_utc_date_time: Option<DateTime<Utc>>,
    pub next_utc_date_time: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Per-partition lock and cron gate for the scheduled sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DfMaintenance {
    pub id: i64,
    pub pac_id: i64,
    pub is_scheduled_df_process_request_started: bool,
    pub is_scheduled_df_process_request_completed: bool,
    pub last_scheduled_df_process_request_utc_date_time: Option<DateTime<Utc>>,
    pub next_scheduled_df_process_request_utc_date_time: Option<DateTime<Utc>>,
    pub scheduled_df_process_request_processor_identifier: String,
    pub is_paused: bool,
    pub paused_by_username: String,
    pub paused_utc_date_time: Option<DateTime<Utc>>,
}

/// Entry of the run to-do list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRef {
    pub task_id: i64,
    pub task_code: String,
    pub dyna_flow_id: i64,
    pub task_type_name: String,
    pub priority_level: i32,
}

/// Entry of the build to-do list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FlowRef {
    pub flow_id: i64,
    pub flow_code: String,
    pub flow_type_name: String,
    pub priority_level: i32,
}

// ============================================================================
// New-row constructors
// ============================================================================

/// Values for a new flow row. The store assigns id and code.
#[derive(Debug, Clone, Default)]
pub struct NewDynaFlow {
    pub dyna_flow_type_id: i64,
    pub pac_id: i64,
    pub parent_dyna_flow_id: Option<i64>,
    pub root_dyna_flow_id: Option<i64>,
    pub dependency_dyna_flow_id: Option<i64>,
    pub priority_level: i32,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub is_build_task_debug_required: bool,
    pub is_run_task_debug_required: bool,
    pub param: Option<String>,
    pub subject_code: Option<String>,
}

/// Values for a new task row. The store assigns id and code.
#[derive(Debug, Clone, Default)]
pub struct NewDynaFlowTask {
    pub dyna_flow_id: i64,
    pub dyna_flow_task_type_id: i64,
    pub max_retry_count: i32,
    pub min_start_utc_date_time: Option<DateTime<Utc>>,
    pub is_run_task_debug_required: bool,
    pub param: Option<String>,
}

/// Values for a new schedule row.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub pac_id: i64,
    pub dyna_flow_type_id: i64,
    pub frequency_in_hours: i32,
    pub next_utc_date_time: Option<DateTime<Utc>>,
}

/// Catalog entry for a task type, as declared by the handler registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTypeSpec {
    pub lookup_enum_name: String,
    pub description: String,
    pub max_retry_count: i32,
}

impl TaskTypeSpec {
    /// Spec whose description is the name itself.
    pub fn new(lookup_enum_name: impl Into<String>, max_retry_count: i32) -> Self {
        let lookup_enum_name = lookup_enum_name.into();
        Self {
            description: lookup_enum_name.clone(),
            lookup_enum_name,
            max_retry_count,
        }
    }
}

/// Catalog entry for a flow type, as declared by the handler registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTypeSpec {
    pub lookup_enum_name: String,
    pub description: String,
    pub priority_level: i32,
}

impl FlowTypeSpec {
    /// Spec whose description is the name itself.
    pub fn new(lookup_enum_name: impl Into<String>, priority_level: i32) -> Self {
        let lookup_enum_name = lookup_enum_name.into();
        Self {
            description: lookup_enum_name.clone(),
            lookup_enum_name,
            priority_level,
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Lookup key for flows and tasks.
#[derive(Debug, Clone, Copy)]
pub enum RecordKey<'a> {
    Id(i64),
    Code(&'a str),
}

/// Sort order applied to the flow priority of to-do lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PriorityOrder {
    #[default]
    HighestFirst,
    LowestFirst,
}

impl PriorityOrder {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            PriorityOrder::HighestFirst => "DESC",
            PriorityOrder::LowestFirst => "ASC",
        }
    }
}

/// Filter for [`StoreSession::get_run_todo_list`].
#[derive(Debug, Clone)]
pub struct RunTodoFilter {
    pub pac_id: i64,
    /// Tasks whose min-start lies after this instant are excluded.
    pub now: DateTime<Utc>,
    pub priority_order: PriorityOrder,
    /// Skip tasks (or flows) flagged for manual debug runs.
    pub exclude_debug: bool,
    pub limit: i64,
}

/// Filter for [`StoreSession::get_build_todo_list`].
#[derive(Debug, Clone)]
pub struct BuildTodoFilter {
    pub pac_id: i64,
    pub now: DateTime<Utc>,
    pub priority_order: PriorityOrder,
    pub exclude_debug: bool,
    pub limit: i64,
}

/// Filter for [`StoreSession::search_tasks`]. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TaskSearch {
    pub dyna_flow_id: Option<i64>,
    pub processor_identifier: Option<String>,
    pub is_started: Option<bool>,
    pub is_completed: Option<bool>,
    pub limit: Option<i64>,
}

// ============================================================================
// Store traits
// ============================================================================

/// Factory for units of work.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Open a new unit of work.
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError>;
}

/// One unit of work over the task store.
///
/// Implementations hold a single open transaction. Callers must not open a
/// second session while holding one.
#[async_trait]
pub trait StoreSession: Send {
    // ========================================================================
    // Partitions and catalogs
    // ========================================================================

    /// Insert the partition or update its name, keyed by code.
    async fn upsert_pac(&mut self, code: &str, name: &str) -> Result<Pac, StoreError>;

    /// Load a partition by code.
    async fn find_pac(&mut self, code: &str) -> Result<Option<Pac>, StoreError>;

    /// Insert a task type, or refresh its description if the name exists.
    ///
    /// An existing `max_retry_count` is left untouched so operator tuning survives restarts.
    async fn upsert_task_type(
        &mut self,
        pac_id: i64,
        spec: &TaskTypeSpec,
    ) -> Result<DynaFlowTaskType, StoreError>;

    /// Insert a flow type, or refresh its description if the name exists.
    async fn upsert_flow_type(
        &mut self,
        pac_id: i64,
        spec: &FlowTypeSpec,
    ) -> Result<DynaFlowType, StoreError>;

    async fn list_task_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowTaskType>, StoreError>;

    async fn list_flow_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowType>, StoreError>;

    async fn get_task_type(&mut self, id: i64) -> Result<Option<DynaFlowTaskType>, StoreError>;

    async fn get_flow_type(&mut self, id: i64) -> Result<Option<DynaFlowType>, StoreError>;

    async fn find_task_type(
        &mut self,
        pac_id: i64,
        lookup_enum_name: &str,
    ) -> Result<Option<DynaFlowTaskType>, StoreError>;

    async fn find_flow_type(
        &mut self,
        pac_id: i64,
        lookup_enum_name: &str,
    ) -> Result<Option<DynaFlowType>, StoreError>;

    // ========================================================================
    // Flows
    // ========================================================================

    async fn insert_flow(&mut self, new: &NewDynaFlow) -> Result<DynaFlow, StoreError>;

    async fn load_flow(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlow>, StoreError>;

    /// Load a flow and lock its row for the rest of the session where supported.
    async fn lock_flow(&mut self, id: i64) -> Result<Option<DynaFlow>, StoreError>;

    /// Persist every mutable column of the flow.
    async fn save_flow(&mut self, flow: &DynaFlow) -> Result<(), StoreError>;

    /// Take the task-build claim on a flow.
    ///
    /// Guarded by `is_task_creation_started = false` and not completed; returns
    /// false when the guard matched no row.
    async fn claim_flow_build(
        &mut self,
        id: i64,
        owner: &str,
        priority_level: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_child_flows(&mut self, parent_id: i64) -> Result<Vec<DynaFlow>, StoreError>;

    async fn get_build_todo_list(
        &mut self,
        filter: &BuildTodoFilter,
    ) -> Result<Vec<FlowRef>, StoreError>;

    /// Flows whose build claim was taken before `claimed_before` and never finished.
    async fn get_abandoned_flow_builds(
        &mut self,
        pac_id: i64,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<DynaFlow>, StoreError>;

    /// Flows whose unfinished build claim is held by `owner`.
    async fn get_unfinished_flow_builds(&mut self, owner: &str)
    -> Result<Vec<DynaFlow>, StoreError>;

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn insert_task(&mut self, new: &NewDynaFlowTask) -> Result<DynaFlowTask, StoreError>;

    async fn load_task(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlowTask>, StoreError>;

    /// Load a task and lock its row for the rest of the session where supported.
    async fn lock_task(&mut self, id: i64) -> Result<Option<DynaFlowTask>, StoreError>;

    /// Persist every mutable column of the task.
    async fn save_task(&mut self, task: &DynaFlowTask) -> Result<(), StoreError>;

    /// Take the run claim on a task.
    ///
    /// Guarded by `is_started = false` and not terminal; returns false when
    /// the guard matched no row.
    async fn claim_task_run(
        &mut self,
        id: i64,
        owner: &str,
        max_retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_flow_tasks(&mut self, flow_id: i64) -> Result<Vec<DynaFlowTask>, StoreError>;

    async fn get_run_todo_list(&mut self, filter: &RunTodoFilter)
    -> Result<Vec<TaskRef>, StoreError>;

    async fn search_tasks(&mut self, search: &TaskSearch) -> Result<Vec<DynaFlowTask>, StoreError>;

    /// Running tasks whose claim was taken before `claimed_before`.
    async fn get_abandoned_tasks(
        &mut self,
        pac_id: i64,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<DynaFlowTask>, StoreError>;

    // ========================================================================
    // Maintenance and schedules
    // ========================================================================

    /// Load the partition's maintenance row, creating it on first use, and
    /// lock it for the rest of the session where supported.
    async fn get_or_create_maintenance(&mut self, pac_id: i64)
    -> Result<DfMaintenance, StoreError>;

    async fn save_maintenance(&mut self, maintenance: &DfMaintenance) -> Result<(), StoreError>;

    async fn insert_schedule(
        &mut self,
        new: &NewSchedule,
    ) -> Result<DynaFlowTypeSchedule, StoreError>;

    /// Active schedules whose next run is unset or not after `now`.
    async fn get_due_schedules(
        &mut self,
        pac_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DynaFlowTypeSchedule>, StoreError>;

    async fn save_schedule(&mut self, schedule: &DynaFlowTypeSchedule) -> Result<(), StoreError>;

    // ========================================================================
    // Unit of work
    // ========================================================================

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Connect to the store named by `database_url` and apply migrations.
///
/// `sqlite:` URLs select [`SqliteTaskStore`]; `postgres://` and
/// `postgresql://` select [`PostgresTaskStore`].
pub async fn connect(database_url: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTaskStore::connect(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        Ok(Arc::new(PostgresTaskStore::connect(database_url).await?))
    } else {
        Err(StoreError::UnsupportedUrl(database_url.to_string()))
    }
}

/// Fresh code for a new flow or task row.
pub(crate) fn new_code() -> String {
    uuid::Uuid::new_v4().to_string()
}
