// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed task store.
//!
//! `lock_*` and the maintenance lookup use `SELECT ... FOR UPDATE`, so a
//! competing session blocks on the row until the holder commits or rolls back
//! and then observes the committed flags.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::StoreError;

use super::{
    BuildTodoFilter, DfMaintenance, DynaFlow, DynaFlowTask, DynaFlowTaskType, DynaFlowType,
    DynaFlowTypeSchedule, FlowRef, FlowTypeSpec, NewDynaFlow, NewDynaFlowTask, NewSchedule, Pac,
    RecordKey, RunTodoFilter, StoreSession, TaskRef, TaskSearch, TaskStore, TaskTypeSpec,
    new_code,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// PostgreSQL-backed task store.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a store over an existing pool. Migrations are not applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a `postgres://` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect",
                details: e.to_string(),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresSession { tx }))
    }
}

/// Unit of work over one PostgreSQL transaction.
pub struct PostgresSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreSession for PostgresSession {
    // ========================================================================
    // Partitions and catalogs
    // ========================================================================

    async fn upsert_pac(&mut self, code: &str, name: &str) -> Result<Pac, StoreError> {
        let pac = sqlx::query_as::<_, Pac>(
            r#"
            INSERT INTO pacs (code, name) VALUES ($1, $2)
            ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, code, name
            "#,
        )
        .bind(code)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pac)
    }

    async fn find_pac(&mut self, code: &str) -> Result<Option<Pac>, StoreError> {
        let pac = sqlx::query_as::<_, Pac>("SELECT id, code, name FROM pacs WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(pac)
    }

    async fn upsert_task_type(
        &mut self,
        pac_id: i64,
        spec: &TaskTypeSpec,
    ) -> Result<DynaFlowTaskType, StoreError> {
        let task_type = sqlx::query_as::<_, DynaFlowTaskType>(
            r#"
            INSERT INTO dyna_flow_task_types (pac_id, lookup_enum_name, description, max_retry_count, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (pac_id, lookup_enum_name) DO UPDATE SET description = EXCLUDED.description
            RETURNING *
            "#,
        )
        .bind(pac_id)
        .bind(&spec.lookup_enum_name)
        .bind(&spec.description)
        .bind(spec.max_retry_count)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(task_type)
    }

    async fn upsert_flow_type(
        &mut self,
        pac_id: i64,
        spec: &FlowTypeSpec,
    ) -> Result<DynaFlowType, StoreError> {
        let flow_type = sqlx::query_as::<_, DynaFlowType>(
            r#"
            INSERT INTO dyna_flow_types (pac_id, lookup_enum_name, description, priority_level, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (pac_id, lookup_enum_name) DO UPDATE SET description = EXCLUDED.description
            RETURNING *
            "#,
        )
        .bind(pac_id)
        .bind(&spec.lookup_enum_name)
        .bind(&spec.description)
        .bind(spec.priority_level)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(flow_type)
    }

    async fn list_task_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowTaskType>, StoreError> {
        let types = sqlx::query_as::<_, DynaFlowTaskType>(
            "SELECT * FROM dyna_flow_task_types WHERE pac_id = $1 ORDER BY lookup_enum_name",
        )
        .bind(pac_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(types)
    }

    async fn list_flow_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowType>, StoreError> {
        let types = sqlx::query_as::<_, DynaFlowType>(
            "SELECT * FROM dyna_flow_types WHERE pac_id = $1 ORDER BY lookup_enum_name",
        )
        .bind(pac_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(types)
    }

    async fn get_task_type(&mut self, id: i64) -> Result<Option<DynaFlowTaskType>, StoreError> {
        let task_type = sqlx::query_as::<_, DynaFlowTaskType>(
            "SELECT * FROM dyna_flow_task_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(task_type)
    }

    async fn get_flow_type(&mut self, id: i64) -> Result<Option<DynaFlowType>, StoreError> {
        let flow_type =
            sqlx::query_as::<_, DynaFlowType>("SELECT * FROM dyna_flow_types WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(flow_type)
    }

    async fn find_task_type(
        &mut self,
        pac_id: i64,
        lookup_enum_name: &str,
    ) -> Result<Option<DynaFlowTaskType>, StoreError> {
        let task_type = sqlx::query_as::<_, DynaFlowTaskType>(
            "SELECT * FROM dyna_flow_task_types WHERE pac_id = $1 AND lookup_enum_name = $2",
        )
        .bind(pac_id)
        .bind(lookup_enum_name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(task_type)
    }

    async fn find_flow_type(
        &mut self,
        pac_id: i64,
        lookup_enum_name: &str,
    ) -> Result<Option<DynaFlowType>, StoreError> {
        let flow_type = sqlx::query_as::<_, DynaFlowType>(
            "SELECT * FROM dyna_flow_types WHERE pac_id = $1 AND lookup_enum_name = $2",
        )
        .bind(pac_id)
        .bind(lookup_enum_name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(flow_type)
    }

    // ========================================================================
    // Flows
    // ========================================================================

    async fn insert_flow(&mut self, new: &NewDynaFlow) -> Result<DynaFlow, StoreError> {
        let flow = sqlx::query_as::<_, DynaFlow>(
            r#"
            INSERT INTO dyna_flows (
                code, dyna_flow_type_id, pac_id, parent_dyna_flow_id, root_dyna_flow_id,
                dependency_dyna_flow_id, priority_level, requested_utc_date_time,
                min_start_utc_date_time, is_build_task_debug_required,
                is_run_task_debug_required, param, subject_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(new_code())
        .bind(new.dyna_flow_type_id)
        .bind(new.pac_id)
        .bind(new.parent_dyna_flow_id)
        .bind(new.root_dyna_flow_id)
        .bind(new.dependency_dyna_flow_id)
        .bind(new.priority_level)
        .bind(Utc::now())
        .bind(new.min_start_utc_date_time)
        .bind(new.is_build_task_debug_required)
        .bind(new.is_run_task_debug_required)
        .bind(&new.param)
        .bind(&new.subject_code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(flow)
    }

    async fn load_flow(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlow>, StoreError> {
        let flow = match key {
            RecordKey::Id(id) => {
                sqlx::query_as::<_, DynaFlow>("SELECT * FROM dyna_flows WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            RecordKey::Code(code) => {
                sqlx::query_as::<_, DynaFlow>("SELECT * FROM dyna_flows WHERE code = $1")
                    .bind(code)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
        };
        Ok(flow)
    }

    async fn lock_flow(&mut self, id: i64) -> Result<Option<DynaFlow>, StoreError> {
        let flow =
            sqlx::query_as::<_, DynaFlow>("SELECT * FROM dyna_flows WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(flow)
    }

    async fn save_flow(&mut self, flow: &DynaFlow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flows SET
                parent_dyna_flow_id = $1,
                root_dyna_flow_id = $2,
                dependency_dyna_flow_id = $3,
                priority_level = $4,
                started_utc_date_time = $5,
                completed_utc_date_time = $6,
                min_start_utc_date_time = $7,
                is_started = $8,
                is_completed = $9,
                is_successful = $10,
                is_canceled = $11,
                is_cancel_requested = $12,
                is_paused = $13,
                is_resubmitted = $14,
                is_tasks_created = $15,
                is_task_creation_started = $16,
                is_build_task_debug_required = $17,
                is_run_task_debug_required = $18,
                task_creation_processor_identifier = $19,
                task_creation_started_utc_date_time = $20,
                param = $21,
                result_value = $22,
                subject_code = $23
            WHERE id = $24
            "#,
        )
        .bind(flow.parent_dyna_flow_id)
        .bind(flow.root_dyna_flow_id)
        .bind(flow.dependency_dyna_flow_id)
        .bind(flow.priority_level)
        .bind(flow.started_utc_date_time)
        .bind(flow.completed_utc_date_time)
        .bind(flow.min_start_utc_date_time)
        .bind(flow.is_started)
        .bind(flow.is_completed)
        .bind(flow.is_successful)
        .bind(flow.is_canceled)
        .bind(flow.is_cancel_requested)
        .bind(flow.is_paused)
        .bind(flow.is_resubmitted)
        .bind(flow.is_tasks_created)
        .bind(flow.is_task_creation_started)
        .bind(flow.is_build_task_debug_required)
        .bind(flow.is_run_task_debug_required)
        .bind(&flow.task_creation_processor_identifier)
        .bind(flow.task_creation_started_utc_date_time)
        .bind(&flow.param)
        .bind(&flow.result_value)
        .bind(&flow.subject_code)
        .bind(flow.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("flow", flow.id));
        }
        Ok(())
    }

    async fn claim_flow_build(
        &mut self,
        id: i64,
        owner: &str,
        priority_level: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flows
            SET is_task_creation_started = TRUE,
                task_creation_processor_identifier = $1,
                task_creation_started_utc_date_time = $2,
                priority_level = $3
            WHERE id = $4 AND is_task_creation_started = FALSE AND is_completed = FALSE
            "#,
        )
        .bind(owner)
        .bind(now)
        .bind(priority_level)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_child_flows(&mut self, parent_id: i64) -> Result<Vec<DynaFlow>, StoreError> {
        let flows = sqlx::query_as::<_, DynaFlow>(
            "SELECT * FROM dyna_flows WHERE parent_dyna_flow_id = $1 ORDER BY id",
        )
        .bind(parent_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(flows)
    }

    async fn get_build_todo_list(
        &mut self,
        filter: &BuildTodoFilter,
    ) -> Result<Vec<FlowRef>, StoreError> {
        let sql = format!(
            r#"
            SELECT f.id AS flow_id, f.code AS flow_code,
                   ft.lookup_enum_name AS flow_type_name, f.priority_level
            FROM dyna_flows f
            JOIN dyna_flow_types ft ON ft.id = f.dyna_flow_type_id
            LEFT JOIN dyna_flows dep ON dep.id = f.dependency_dyna_flow_id
            WHERE f.pac_id = $1
              AND NOT f.is_tasks_created
              AND NOT f.is_task_creation_started
              AND NOT f.is_completed
              AND (NOT f.is_paused OR f.is_cancel_requested)
              AND (f.min_start_utc_date_time IS NULL OR f.min_start_utc_date_time <= $2)
              AND (dep.id IS NULL OR dep.is_completed)
              AND ($3 = FALSE OR NOT f.is_build_task_debug_required)
            ORDER BY f.priority_level {}, f.id ASC
            LIMIT $4
            "#,
            filter.priority_order.sql()
        );

        let flows = sqlx::query_as::<_, FlowRef>(&sql)
            .bind(filter.pac_id)
            .bind(filter.now)
            .bind(filter.exclude_debug)
            .bind(filter.limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(flows)
    }

    async fn get_abandoned_flow_builds(
        &mut self,
        pac_id: i64,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<DynaFlow>, StoreError> {
        let flows = sqlx::query_as::<_, DynaFlow>(
            r#"
            SELECT * FROM dyna_flows
            WHERE pac_id = $1
              AND is_task_creation_started
              AND NOT is_tasks_created
              AND NOT is_completed
              AND (task_creation_started_utc_date_time IS NULL
                   OR task_creation_started_utc_date_time < $2)
            ORDER BY id
            "#,
        )
        .bind(pac_id)
        .bind(claimed_before)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(flows)
    }

    async fn get_unfinished_flow_builds(
        &mut self,
        owner: &str,
    ) -> Result<Vec<DynaFlow>, StoreError> {
        let flows = sqlx::query_as::<_, DynaFlow>(
            r#"
            SELECT * FROM dyna_flows
            WHERE task_creation_processor_identifier = $1
              AND is_task_creation_started
              AND NOT is_tasks_created
              AND NOT is_completed
            ORDER BY id
            "#,
        )
        .bind(owner)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(flows)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn insert_task(&mut self, new: &NewDynaFlowTask) -> Result<DynaFlowTask, StoreError> {
        let task = sqlx::query_as::<_, DynaFlowTask>(
            r#"
            INSERT INTO dyna_flow_tasks (
                code, dyna_flow_id, dyna_flow_task_type_id, max_retry_count,
                min_start_utc_date_time, requested_utc_date_time,
                is_run_task_debug_required, param
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new_code())
        .bind(new.dyna_flow_id)
        .bind(new.dyna_flow_task_type_id)
        .bind(new.max_retry_count)
        .bind(new.min_start_utc_date_time)
        .bind(Utc::now())
        .bind(new.is_run_task_debug_required)
        .bind(&new.param)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(task)
    }

    async fn load_task(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlowTask>, StoreError> {
        let task = match key {
            RecordKey::Id(id) => {
                sqlx::query_as::<_, DynaFlowTask>("SELECT * FROM dyna_flow_tasks WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            RecordKey::Code(code) => {
                sqlx::query_as::<_, DynaFlowTask>("SELECT * FROM dyna_flow_tasks WHERE code = $1")
                    .bind(code)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
        };
        Ok(task)
    }

    async fn lock_task(&mut self, id: i64) -> Result<Option<DynaFlowTask>, StoreError> {
        let task = sqlx::query_as::<_, DynaFlowTask>(
            "SELECT * FROM dyna_flow_tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(task)
    }

    async fn save_task(&mut self, task: &DynaFlowTask) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flow_tasks SET
                processor_identifier = $1,
                retry_count = $2,
                max_retry_count = $3,
                min_start_utc_date_time = $4,
                started_utc_date_time = $5,
                completed_utc_date_time = $6,
                is_started = $7,
                is_completed = $8,
                is_successful = $9,
                is_canceled = $10,
                is_run_task_debug_required = $11,
                param = $12,
                result_value = $13,
                last_error = $14
            WHERE id = $15
            "#,
        )
        .bind(&task.processor_identifier)
        .bind(task.retry_count)
        .bind(task.max_retry_count)
        .bind(task.min_start_utc_date_time)
        .bind(task.started_utc_date_time)
        .bind(task.completed_utc_date_time)
        .bind(task.is_started)
        .bind(task.is_completed)
        .bind(task.is_successful)
        .bind(task.is_canceled)
        .bind(task.is_run_task_debug_required)
        .bind(&task.param)
        .bind(&task.result_value)
        .bind(&task.last_error)
        .bind(task.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", task.id));
        }
        Ok(())
    }

    async fn claim_task_run(
        &mut self,
        id: i64,
        owner: &str,
        max_retry_count: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flow_tasks
            SET is_started = TRUE,
                processor_identifier = $1,
                started_utc_date_time = $2,
                max_retry_count = $3
            WHERE id = $4 AND NOT is_started AND NOT is_completed AND NOT is_canceled
            "#,
        )
        .bind(owner)
        .bind(now)
        .bind(max_retry_count)
        .bind(id)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_flow_tasks(&mut self, flow_id: i64) -> Result<Vec<DynaFlowTask>, StoreError> {
        let tasks = sqlx::query_as::<_, DynaFlowTask>(
            "SELECT * FROM dyna_flow_tasks WHERE dyna_flow_id = $1 ORDER BY id",
        )
        .bind(flow_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(tasks)
    }

    async fn get_run_todo_list(
        &mut self,
        filter: &RunTodoFilter,
    ) -> Result<Vec<TaskRef>, StoreError> {
        let sql = format!(
            r#"
            SELECT t.id AS task_id, t.code AS task_code, t.dyna_flow_id,
                   tt.lookup_enum_name AS task_type_name, f.priority_level
            FROM dyna_flow_tasks t
            JOIN dyna_flows f ON f.id = t.dyna_flow_id
            JOIN dyna_flow_task_types tt ON tt.id = t.dyna_flow_task_type_id
            WHERE f.pac_id = $1
              AND NOT f.is_completed
              AND (NOT f.is_paused OR f.is_cancel_requested)
              AND NOT t.is_started
              AND NOT t.is_completed
              AND NOT t.is_canceled
              AND (t.min_start_utc_date_time IS NULL OR t.min_start_utc_date_time <= $2)
              AND ($3 = FALSE OR (NOT t.is_run_task_debug_required AND NOT f.is_run_task_debug_required))
            ORDER BY f.priority_level {}, t.id ASC
            LIMIT $4
            "#,
            filter.priority_order.sql()
        );

        let tasks = sqlx::query_as::<_, TaskRef>(&sql)
            .bind(filter.pac_id)
            .bind(filter.now)
            .bind(filter.exclude_debug)
            .bind(filter.limit)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(tasks)
    }

    async fn search_tasks(&mut self, search: &TaskSearch) -> Result<Vec<DynaFlowTask>, StoreError> {
        let tasks = sqlx::query_as::<_, DynaFlowTask>(
            r#"
            SELECT * FROM dyna_flow_tasks
            WHERE ($1::BIGINT IS NULL OR dyna_flow_id = $1)
              AND ($2::TEXT IS NULL OR processor_identifier = $2)
              AND ($3::BOOLEAN IS NULL OR is_started = $3)
              AND ($4::BOOLEAN IS NULL OR is_completed = $4)
            ORDER BY id
            LIMIT $5
            "#,
        )
        .bind(search.dyna_flow_id)
        .bind(&search.processor_identifier)
        .bind(search.is_started)
        .bind(search.is_completed)
        .bind(search.limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(tasks)
    }

    async fn get_abandoned_tasks(
        &mut self,
        pac_id: i64,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<DynaFlowTask>, StoreError> {
        let tasks = sqlx::query_as::<_, DynaFlowTask>(
            r#"
            SELECT t.* FROM dyna_flow_tasks t
            JOIN dyna_flows f ON f.id = t.dyna_flow_id
            WHERE f.pac_id = $1
              AND NOT f.is_completed
              AND t.is_started
              AND NOT t.is_completed
              AND NOT t.is_canceled
              AND (t.started_utc_date_time IS NULL OR t.started_utc_date_time < $2)
            ORDER BY t.id
            "#,
        )
        .bind(pac_id)
        .bind(claimed_before)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(tasks)
    }

    // ========================================================================
    // Maintenance and schedules
    // ========================================================================

    async fn get_or_create_maintenance(
        &mut self,
        pac_id: i64,
    ) -> Result<DfMaintenance, StoreError> {
        sqlx::query(
            "INSERT INTO df_maintenance (pac_id) VALUES ($1) ON CONFLICT (pac_id) DO NOTHING",
        )
        .bind(pac_id)
        .execute(&mut *self.tx)
        .await?;

        let maintenance = sqlx::query_as::<_, DfMaintenance>(
            "SELECT * FROM df_maintenance WHERE pac_id = $1 FOR UPDATE",
        )
        .bind(pac_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(maintenance)
    }

    async fn save_maintenance(&mut self, maintenance: &DfMaintenance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE df_maintenance SET
                is_scheduled_df_process_request_started = $1,
                is_scheduled_df_process_request_completed = $2,
                last_scheduled_df_process_request_utc_date_time = $3,
                next_scheduled_df_process_request_utc_date_time = $4,
                scheduled_df_process_request_processor_identifier = $5,
                is_paused = $6,
                paused_by_username = $7,
                paused_utc_date_time = $8
            WHERE id = $9
            "#,
        )
        .bind(maintenance.is_scheduled_df_process_request_started)
        .bind(maintenance.is_scheduled_df_process_request_completed)
        .bind(maintenance.last_scheduled_df_process_request_utc_date_time)
        .bind(maintenance.next_scheduled_df_process_request_utc_date_time)
        .bind(&maintenance.scheduled_df_process_request_processor_identifier)
        .bind(maintenance.is_paused)
        .bind(&maintenance.paused_by_username)
        .bind(maintenance.paused_utc_date_time)
        .bind(maintenance.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_schedule(
        &mut self,
        new: &NewSchedule,
    ) -> Result<DynaFlowTypeSchedule, StoreError> {
        let schedule = sqlx::query_as::<_, DynaFlowTypeSchedule>(
            r#"
            INSERT INTO dyna_flow_type_schedules (pac_id, dyna_flow_type_id, frequency_in_hours, next_utc_date_time, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            RETURNING *
            "#,
        )
        .bind(new.pac_id)
        .bind(new.dyna_flow_type_id)
        .bind(new.frequency_in_hours)
        .bind(new.next_utc_date_time)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(schedule)
    }

    async fn get_due_schedules(
        &mut self,
        pac_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<DynaFlowTypeSchedule>, StoreError> {
        let schedules = sqlx::query_as::<_, DynaFlowTypeSchedule>(
            r#"
            SELECT * FROM dyna_flow_type_schedules
            WHERE pac_id = $1
              AND is_active
              AND (next_utc_date_time IS NULL OR next_utc_date_time <= $2)
            ORDER BY id
            FOR UPDATE
            "#,
        )
        .bind(pac_id)
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(schedules)
    }

    async fn save_schedule(&mut self, schedule: &DynaFlowTypeSchedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE dyna_flow_type_schedules SET
                frequency_in_hours = $1,
                last_utc_date_time = $2,
                next_utc_date_time = $3,
                is_active = $4
            WHERE id = $5
            "#,
        )
        .bind(schedule.frequency_in_hours)
        .bind(schedule.last_utc_date_time)
        .bind(schedule.next_utc_date_time)
        .bind(schedule.is_active)
        .bind(schedule.id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Unit of work
    // ========================================================================

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let session = *self;
        session.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let session = *self;
        session.tx.rollback().await?;
        Ok(())
    }
}
