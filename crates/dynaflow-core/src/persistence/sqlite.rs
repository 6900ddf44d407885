// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed task store.
//!
//! SQLite has no row locks; a session's first write takes the database write
//! lock, and a competing session that read before that write fails with a
//! busy error. The guarded claim updates turn every lost race into either
//! zero affected rows or such an error.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::StoreError;

use super::{
    BuildTodoFilter, DfMaintenance, DynaFlow, DynaFlowTask, DynaFlowTaskType, DynaFlowType,
    DynaFlowTypeSchedule, FlowRef, FlowTypeSpec, NewDynaFlow, NewDynaFlowTask, NewSchedule, Pac,
    RecordKey, RunTodoFilter, StoreSession, TaskRef, TaskSearch, TaskStore, TaskTypeSpec,
    new_code,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a store over an existing pool. Migrations are not applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL, creating the database if needed, and run migrations.
    ///
    /// In-memory databases are limited to a single pooled connection that is
    /// never recycled, since every new connection would open an empty database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database {
                operation: "connect",
                details: format!("failed to connect to {}: {}", url, e),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open (or create) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database {
                operation: "create_dir",
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn begin(&self) -> Result<Box<dyn StoreSession>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteSession { tx }))
    }
}

/// Unit of work over one SQLite transaction.
pub struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteSession {
    async fn require_flow(&mut self, id: i64) -> Result<DynaFlow, StoreError> {
        self.load_flow(RecordKey::Id(id))
            .await?
            .ok_or_else(|| StoreError::not_found("flow", id))
    }

    async fn require_task(&mut self, id: i64) -> Result<DynaFlowTask, StoreError> {
        self.load_task(RecordKey::Id(id))
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))
    }
}

#[async_trait]
impl StoreSession for SqliteSession {
    // ========================================================================
    // Partitions and catalogs
    // ========================================================================

    async fn upsert_pac(&mut self, code: &str, name: &str) -> Result<Pac, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pacs (code, name) VALUES (?, ?)
            ON CONFLICT(code) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(code)
        .bind(name)
        .execute(&mut *self.tx)
        .await?;

        self.find_pac(code)
            .await?
            .ok_or_else(|| StoreError::not_found("pac", code))
    }

    async fn find_pac(&mut self, code: &str) -> Result<Option<Pac>, StoreError> {
        let pac = sqlx::query_as::<_, Pac>("SELECT id, code, name FROM pacs WHERE code = ?")
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
        sqlx::query(
            r#"
            INSERT INTO dyna_flow_task_types (pac_id, lookup_enum_name, description, max_retry_count, is_active)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(pac_id, lookup_enum_name) DO UPDATE SET description = excluded.description
            "#,
        )
        .bind(pac_id)
        .bind(&spec.lookup_enum_name)
        .bind(&spec.description)
        .bind(spec.max_retry_count)
        .execute(&mut *self.tx)
        .await?;

        self.find_task_type(pac_id, &spec.lookup_enum_name)
            .await?
            .ok_or_else(|| StoreError::not_found("task type", &spec.lookup_enum_name))
    }

    async fn upsert_flow_type(
        &mut self,
        pac_id: i64,
        spec: &FlowTypeSpec,
    ) -> Result<DynaFlowType, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dyna_flow_types (pac_id, lookup_enum_name, description, priority_level, is_active)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(pac_id, lookup_enum_name) DO UPDATE SET description = excluded.description
            "#,
        )
        .bind(pac_id)
        .bind(&spec.lookup_enum_name)
        .bind(&spec.description)
        .bind(spec.priority_level)
        .execute(&mut *self.tx)
        .await?;

        self.find_flow_type(pac_id, &spec.lookup_enum_name)
            .await?
            .ok_or_else(|| StoreError::not_found("flow type", &spec.lookup_enum_name))
    }

    async fn list_task_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowTaskType>, StoreError> {
        let types = sqlx::query_as::<_, DynaFlowTaskType>(
            "SELECT * FROM dyna_flow_task_types WHERE pac_id = ? ORDER BY lookup_enum_name",
        )
        .bind(pac_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(types)
    }

    async fn list_flow_types(&mut self, pac_id: i64) -> Result<Vec<DynaFlowType>, StoreError> {
        let types = sqlx::query_as::<_, DynaFlowType>(
            "SELECT * FROM dyna_flow_types WHERE pac_id = ? ORDER BY lookup_enum_name",
        )
        .bind(pac_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(types)
    }

    async fn get_task_type(&mut self, id: i64) -> Result<Option<DynaFlowTaskType>, StoreError> {
        let task_type =
            sqlx::query_as::<_, DynaFlowTaskType>("SELECT * FROM dyna_flow_task_types WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(task_type)
    }

    async fn get_flow_type(&mut self, id: i64) -> Result<Option<DynaFlowType>, StoreError> {
        let flow_type =
            sqlx::query_as::<_, DynaFlowType>("SELECT * FROM dyna_flow_types WHERE id = ?")
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
            "SELECT * FROM dyna_flow_task_types WHERE pac_id = ? AND lookup_enum_name = ?",
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
            "SELECT * FROM dyna_flow_types WHERE pac_id = ? AND lookup_enum_name = ?",
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
        let result = sqlx::query(
            r#"
            INSERT INTO dyna_flows (
                code, dyna_flow_type_id, pac_id, parent_dyna_flow_id, root_dyna_flow_id,
                dependency_dyna_flow_id, priority_level, requested_utc_date_time,
                min_start_utc_date_time, is_build_task_debug_required,
                is_run_task_debug_required, param, subject_code
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&mut *self.tx)
        .await?;

        self.require_flow(result.last_insert_rowid()).await
    }

    async fn load_flow(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlow>, StoreError> {
        let flow = match key {
            RecordKey::Id(id) => {
                sqlx::query_as::<_, DynaFlow>("SELECT * FROM dyna_flows WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            RecordKey::Code(code) => {
                sqlx::query_as::<_, DynaFlow>("SELECT * FROM dyna_flows WHERE code = ?")
                    .bind(code)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
        };
        Ok(flow)
    }

    async fn lock_flow(&mut self, id: i64) -> Result<Option<DynaFlow>, StoreError> {
        self.load_flow(RecordKey::Id(id)).await
    }

    async fn save_flow(&mut self, flow: &DynaFlow) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flows SET
                parent_dyna_flow_id = ?,
                root_dyna_flow_id = ?,
                dependency_dyna_flow_id = ?,
                priority_level = ?,
                started_utc_date_time = ?,
                completed_utc_date_time = ?,
                min_start_utc_date_time = ?,
                is_started = ?,
                is_completed = ?,
                is_successful = ?,
                is_canceled = ?,
                is_cancel_requested = ?,
                is_paused = ?,
                is_resubmitted = ?,
                is_tasks_created = ?,
                is_task_creation_started = ?,
                is_build_task_debug_required = ?,
                is_run_task_debug_required = ?,
                task_creation_processor_identifier = ?,
                task_creation_started_utc_date_time = ?,
                param = ?,
                result_value = ?,
                subject_code = ?
            WHERE id = ?
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
            SET is_task_creation_started = 1,
                task_creation_processor_identifier = ?,
                task_creation_started_utc_date_time = ?,
                priority_level = ?
            WHERE id = ? AND is_task_creation_started = 0 AND is_completed = 0
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
            "SELECT * FROM dyna_flows WHERE parent_dyna_flow_id = ? ORDER BY id",
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
            WHERE f.pac_id = ?1
              AND f.is_tasks_created = 0
              AND f.is_task_creation_started = 0
              AND f.is_completed = 0
              AND (f.is_paused = 0 OR f.is_cancel_requested = 1)
              AND (f.min_start_utc_date_time IS NULL OR f.min_start_utc_date_time <= ?2)
              AND (dep.id IS NULL OR dep.is_completed = 1)
              AND (?3 = 0 OR f.is_build_task_debug_required = 0)
            ORDER BY f.priority_level {}, f.id ASC
            LIMIT ?4
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
            WHERE pac_id = ?
              AND is_task_creation_started = 1
              AND is_tasks_created = 0
              AND is_completed = 0
              AND (task_creation_started_utc_date_time IS NULL
                   OR task_creation_started_utc_date_time < ?)
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
            WHERE task_creation_processor_identifier = ?
              AND is_task_creation_started = 1
              AND is_tasks_created = 0
              AND is_completed = 0
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
        let result = sqlx::query(
            r#"
            INSERT INTO dyna_flow_tasks (
                code, dyna_flow_id, dyna_flow_task_type_id, max_retry_count,
                min_start_utc_date_time, requested_utc_date_time,
                is_run_task_debug_required, param
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
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
        .execute(&mut *self.tx)
        .await?;

        self.require_task(result.last_insert_rowid()).await
    }

    async fn load_task(&mut self, key: RecordKey<'_>) -> Result<Option<DynaFlowTask>, StoreError> {
        let task = match key {
            RecordKey::Id(id) => {
                sqlx::query_as::<_, DynaFlowTask>("SELECT * FROM dyna_flow_tasks WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
            RecordKey::Code(code) => {
                sqlx::query_as::<_, DynaFlowTask>("SELECT * FROM dyna_flow_tasks WHERE code = ?")
                    .bind(code)
                    .fetch_optional(&mut *self.tx)
                    .await?
            }
        };
        Ok(task)
    }

    async fn lock_task(&mut self, id: i64) -> Result<Option<DynaFlowTask>, StoreError> {
        self.load_task(RecordKey::Id(id)).await
    }

    async fn save_task(&mut self, task: &DynaFlowTask) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE dyna_flow_tasks SET
                processor_identifier = ?,
                retry_count = ?,
                max_retry_count = ?,
                min_start_utc_date_time = ?,
                started_utc_date_time = ?,
                completed_utc_date_time = ?,
                is_started = ?,
                is_completed = ?,
                is_successful = ?,
                is_canceled = ?,
                is_run_task_debug_required = ?,
                param = ?,
                result_value = ?,
                last_error = ?
            WHERE id = ?
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
            SET is_started = 1,
                processor_identifier = ?,
                started_utc_date_time = ?,
                max_retry_count = ?
            WHERE id = ? AND is_started = 0 AND is_completed = 0 AND is_canceled = 0
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
            "SELECT * FROM dyna_flow_tasks WHERE dyna_flow_id = ? ORDER BY id",
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
            WHERE f.pac_id = ?1
              AND f.is_completed = 0
              AND (f.is_paused = 0 OR f.is_cancel_requested = 1)
              AND t.is_started = 0
              AND t.is_completed = 0
              AND t.is_canceled = 0
              AND (t.min_start_utc_date_time IS NULL OR t.min_start_utc_date_time <= ?2)
              AND (?3 = 0 OR (t.is_run_task_debug_required = 0 AND f.is_run_task_debug_required = 0))
            ORDER BY f.priority_level {}, t.id ASC
            LIMIT ?4
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
            WHERE (?1 IS NULL OR dyna_flow_id = ?1)
              AND (?2 IS NULL OR processor_identifier = ?2)
              AND (?3 IS NULL OR is_started = ?3)
              AND (?4 IS NULL OR is_completed = ?4)
            ORDER BY id
            LIMIT ?5
            "#,
        )
        .bind(search.dyna_flow_id)
        .bind(&search.processor_identifier)
        .bind(search.is_started)
        .bind(search.is_completed)
        .bind(search.limit.unwrap_or(-1))
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
            WHERE f.pac_id = ?
              AND f.is_completed = 0
              AND t.is_started = 1
              AND t.is_completed = 0
              AND t.is_canceled = 0
              AND (t.started_utc_date_time IS NULL OR t.started_utc_date_time < ?)
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
        sqlx::query("INSERT INTO df_maintenance (pac_id) VALUES (?) ON CONFLICT(pac_id) DO NOTHING")
            .bind(pac_id)
            .execute(&mut *self.tx)
            .await?;

        let maintenance =
            sqlx::query_as::<_, DfMaintenance>("SELECT * FROM df_maintenance WHERE pac_id = ?")
                .bind(pac_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(maintenance)
    }

    async fn save_maintenance(&mut self, maintenance: &DfMaintenance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE df_maintenance SET
                is_scheduled_df_process_request_started = ?,
                is_scheduled_df_process_request_completed = ?,
                last_scheduled_df_process_request_utc_date_time = ?,
                next_scheduled_df_process_request_utc_date_time = ?,
                scheduled_df_process_request_processor_identifier = ?,
                is_paused = ?,
                paused_by_username = ?,
                paused_utc_date_time = ?
            WHERE id = ?
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
        let result = sqlx::query(
            r#"
            INSERT INTO dyna_flow_type_schedules (pac_id, dyna_flow_type_id, frequency_in_hours, next_utc_date_time, is_active)
            VALUES (?, ?, ?, ?, 1)
            "#,
        )
        .bind(new.pac_id)
        .bind(new.dyna_flow_type_id)
        .bind(new.frequency_in_hours)
        .bind(new.next_utc_date_time)
        .execute(&mut *self.tx)
        .await?;

        let schedule = sqlx::query_as::<_, DynaFlowTypeSchedule>(
            "SELECT * FROM dyna_flow_type_schedules WHERE id = ?",
        )
        .bind(result.last_insert_rowid())
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
            WHERE pac_id = ?
              AND is_active = 1
              AND (next_utc_date_time IS NULL OR next_utc_date_time <= ?)
            ORDER BY id
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
                frequency_in_hours = ?,
                last_utc_date_time = ?,
                next_utc_date_time = ?,
                is_active = ?
            WHERE id = ?
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PriorityOrder;

    /// Create an in-memory SQLite store for testing.
    async fn test_store() -> SqliteTaskStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        SqliteTaskStore::new(pool)
    }

    struct Fixture {
        pac: Pac,
        flow_type: DynaFlowType,
        task_type: DynaFlowTaskType,
    }

    async fn seed(store: &SqliteTaskStore) -> Fixture {
        let mut uow = store.begin().await.unwrap();
        let pac = uow.upsert_pac("default", "Default").await.unwrap();
        let flow_type = uow
            .upsert_flow_type(
                pac.id,
                &FlowTypeSpec {
                    lookup_enum_name: "Import".to_string(),
                    description: "Import".to_string(),
                    priority_level: 5,
                },
            )
            .await
            .unwrap();
        let task_type = uow
            .upsert_task_type(
                pac.id,
                &TaskTypeSpec {
                    lookup_enum_name: "Fetch".to_string(),
                    description: "Fetch".to_string(),
                    max_retry_count: 2,
                },
            )
            .await
            .unwrap();
        uow.commit().await.unwrap();
        Fixture {
            pac,
            flow_type,
            task_type,
        }
    }

    async fn insert_flow_with_task(
        store: &SqliteTaskStore,
        fx: &Fixture,
        priority_level: i32,
    ) -> (DynaFlow, DynaFlowTask) {
        let mut uow = store.begin().await.unwrap();
        let flow = uow
            .insert_flow(&NewDynaFlow {
                dyna_flow_type_id: fx.flow_type.id,
                pac_id: fx.pac.id,
                priority_level,
                ..Default::default()
            })
            .await
            .unwrap();
        let task = uow
            .insert_task(&NewDynaFlowTask {
                dyna_flow_id: flow.id,
                dyna_flow_task_type_id: fx.task_type.id,
                max_retry_count: fx.task_type.max_retry_count,
                ..Default::default()
            })
            .await
            .unwrap();
        uow.commit().await.unwrap();
        (flow, task)
    }

    fn run_filter(pac_id: i64) -> RunTodoFilter {
        RunTodoFilter {
            pac_id,
            now: Utc::now(),
            priority_order: PriorityOrder::HighestFirst,
            exclude_debug: true,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_upserts_are_idempotent() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let again = seed(&store).await;

        assert_eq!(fx.pac.id, again.pac.id);
        assert_eq!(fx.task_type.id, again.task_type.id);

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.list_task_types(fx.pac.id).await.unwrap().len(), 1);
        assert_eq!(uow.list_flow_types(fx.pac.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_tuned_retry_count() {
        let store = test_store().await;
        let fx = seed(&store).await;

        sqlx::query("UPDATE dyna_flow_task_types SET max_retry_count = 9 WHERE id = ?")
            .bind(fx.task_type.id)
            .execute(store.pool())
            .await
            .unwrap();

        let again = seed(&store).await;
        assert_eq!(again.task_type.max_retry_count, 9);
    }

    #[tokio::test]
    async fn test_insert_and_load_by_code() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (flow, task) = insert_flow_with_task(&store, &fx, 1).await;

        let mut uow = store.begin().await.unwrap();
        let loaded = uow
            .load_task(RecordKey::Code(&task.code))
            .await
            .unwrap()
            .expect("task should exist");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.dyna_flow_id, flow.id);
        assert_eq!(loaded.max_retry_count, 2);
        assert!(loaded.processor_identifier.is_empty());
        assert!(!loaded.is_started);

        let loaded_flow = uow
            .load_flow(RecordKey::Code(&flow.code))
            .await
            .unwrap()
            .expect("flow should exist");
        assert_eq!(loaded_flow, flow);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (_, task) = insert_flow_with_task(&store, &fx, 1).await;

        {
            let mut uow = store.begin().await.unwrap();
            let mut loaded = uow.lock_task(task.id).await.unwrap().unwrap();
            loaded.is_completed = true;
            uow.save_task(&loaded).await.unwrap();
        }

        let mut uow = store.begin().await.unwrap();
        let loaded = uow.load_task(RecordKey::Id(task.id)).await.unwrap().unwrap();
        assert!(!loaded.is_completed);
    }

    #[tokio::test]
    async fn test_claim_task_run_is_guarded() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (_, task) = insert_flow_with_task(&store, &fx, 1).await;
        let now = Utc::now();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.claim_task_run(task.id, "worker-a", 2, now).await.unwrap());
        assert!(!uow.claim_task_run(task.id, "worker-b", 2, now).await.unwrap());
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let loaded = uow.load_task(RecordKey::Id(task.id)).await.unwrap().unwrap();
        assert_eq!(loaded.processor_identifier, "worker-a");
        assert!(loaded.is_started);
        assert!(loaded.started_utc_date_time.is_some());
    }

    #[tokio::test]
    async fn test_claim_flow_build_is_guarded() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (flow, _) = insert_flow_with_task(&store, &fx, 1).await;
        let now = Utc::now();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.claim_flow_build(flow.id, "worker-a", 7, now).await.unwrap());
        assert!(!uow.claim_flow_build(flow.id, "worker-b", 7, now).await.unwrap());
        let loaded = uow.load_flow(RecordKey::Id(flow.id)).await.unwrap().unwrap();
        assert_eq!(loaded.task_creation_processor_identifier, "worker-a");
        assert_eq!(loaded.priority_level, 7);
    }

    #[tokio::test]
    async fn test_run_todo_orders_by_priority_and_honors_min_start() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (_, low) = insert_flow_with_task(&store, &fx, 1).await;
        let (_, high) = insert_flow_with_task(&store, &fx, 9).await;
        let (_, delayed) = insert_flow_with_task(&store, &fx, 5).await;

        let mut uow = store.begin().await.unwrap();
        let mut t = uow.lock_task(delayed.id).await.unwrap().unwrap();
        t.min_start_utc_date_time = Some(Utc::now() + chrono::Duration::minutes(3));
        uow.save_task(&t).await.unwrap();

        let todo = uow.get_run_todo_list(&run_filter(fx.pac.id)).await.unwrap();
        let ids: Vec<i64> = todo.iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
        assert_eq!(todo[0].task_type_name, "Fetch");

        let mut later = run_filter(fx.pac.id);
        later.now = Utc::now() + chrono::Duration::minutes(4);
        later.priority_order = PriorityOrder::LowestFirst;
        let ids: Vec<i64> = uow
            .get_run_todo_list(&later)
            .await
            .unwrap()
            .iter()
            .map(|r| r.task_id)
            .collect();
        assert_eq!(ids, vec![low.id, delayed.id, high.id]);
    }

    #[tokio::test]
    async fn test_run_todo_excludes_debug_tasks() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (_, task) = insert_flow_with_task(&store, &fx, 1).await;

        let mut uow = store.begin().await.unwrap();
        let mut t = uow.lock_task(task.id).await.unwrap().unwrap();
        t.is_run_task_debug_required = true;
        uow.save_task(&t).await.unwrap();

        assert!(
            uow.get_run_todo_list(&run_filter(fx.pac.id))
                .await
                .unwrap()
                .is_empty()
        );

        let mut with_debug = run_filter(fx.pac.id);
        with_debug.exclude_debug = false;
        assert_eq!(uow.get_run_todo_list(&with_debug).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_todo_waits_for_dependency() {
        let store = test_store().await;
        let fx = seed(&store).await;

        let mut uow = store.begin().await.unwrap();
        let first = uow
            .insert_flow(&NewDynaFlow {
                dyna_flow_type_id: fx.flow_type.id,
                pac_id: fx.pac.id,
                ..Default::default()
            })
            .await
            .unwrap();
        let second = uow
            .insert_flow(&NewDynaFlow {
                dyna_flow_type_id: fx.flow_type.id,
                pac_id: fx.pac.id,
                dependency_dyna_flow_id: Some(first.id),
                ..Default::default()
            })
            .await
            .unwrap();

        let filter = BuildTodoFilter {
            pac_id: fx.pac.id,
            now: Utc::now(),
            priority_order: PriorityOrder::HighestFirst,
            exclude_debug: true,
            limit: 100,
        };
        let ids: Vec<i64> = uow
            .get_build_todo_list(&filter)
            .await
            .unwrap()
            .iter()
            .map(|f| f.flow_id)
            .collect();
        assert_eq!(ids, vec![first.id]);

        let mut done = uow.lock_flow(first.id).await.unwrap().unwrap();
        done.is_completed = true;
        uow.save_flow(&done).await.unwrap();

        let todo = uow.get_build_todo_list(&filter).await.unwrap();
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].flow_id, second.id);
        assert_eq!(todo[0].flow_type_name, "Import");
    }

    #[tokio::test]
    async fn test_search_tasks_by_owner() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (_, a) = insert_flow_with_task(&store, &fx, 1).await;
        let (_, _b) = insert_flow_with_task(&store, &fx, 1).await;

        let mut uow = store.begin().await.unwrap();
        uow.claim_task_run(a.id, "worker-a", 2, Utc::now())
            .await
            .unwrap();

        let found = uow
            .search_tasks(&TaskSearch {
                processor_identifier: Some("worker-a".to_string()),
                is_started: Some(true),
                is_completed: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        let all = uow.search_tasks(&TaskSearch::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_queries_respect_cutoff() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (flow, task) = insert_flow_with_task(&store, &fx, 1).await;
        let three_hours_ago = Utc::now() - chrono::Duration::hours(3);

        let mut uow = store.begin().await.unwrap();
        uow.claim_task_run(task.id, "gone", 2, three_hours_ago)
            .await
            .unwrap();
        uow.claim_flow_build(flow.id, "gone", 1, Utc::now())
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(2);
        let tasks = uow.get_abandoned_tasks(fx.pac.id, cutoff).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(
            uow.get_abandoned_flow_builds(fx.pac.id, cutoff)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(uow.get_unfinished_flow_builds("gone").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_todo_skips_paused_unless_cancel_requested() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (flow, task) = insert_flow_with_task(&store, &fx, 1).await;

        let mut uow = store.begin().await.unwrap();
        let mut paused = uow.lock_flow(flow.id).await.unwrap().unwrap();
        paused.is_paused = true;
        uow.save_flow(&paused).await.unwrap();
        assert!(uow.get_run_todo_list(&run_filter(fx.pac.id)).await.unwrap().is_empty());

        paused.is_cancel_requested = true;
        uow.save_flow(&paused).await.unwrap();
        let todo = uow.get_run_todo_list(&run_filter(fx.pac.id)).await.unwrap();
        assert_eq!(todo.len(), 1);
        assert_eq!(todo[0].task_id, task.id);
    }

    #[tokio::test]
    async fn test_completed_flow_tasks_leave_todo_and_abandoned_lists() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let (flow, idle) = insert_flow_with_task(&store, &fx, 1).await;
        let three_hours_ago = Utc::now() - chrono::Duration::hours(3);

        let mut uow = store.begin().await.unwrap();
        let claimed = uow
            .insert_task(&NewDynaFlowTask {
                dyna_flow_id: flow.id,
                dyna_flow_task_type_id: fx.task_type.id,
                max_retry_count: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        uow.claim_task_run(claimed.id, "gone", 2, three_hours_ago)
            .await
            .unwrap();
        let mut closed = uow.lock_flow(flow.id).await.unwrap().unwrap();
        closed.is_completed = true;
        uow.save_flow(&closed).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(2);
        assert!(uow.get_run_todo_list(&run_filter(fx.pac.id)).await.unwrap().is_empty());
        assert!(uow.get_abandoned_tasks(fx.pac.id, cutoff).await.unwrap().is_empty());
        assert!(!uow.load_task(RecordKey::Id(idle.id)).await.unwrap().unwrap().is_started);
    }

    #[tokio::test]
    async fn test_maintenance_get_or_create() {
        let store = test_store().await;
        let fx = seed(&store).await;

        let mut uow = store.begin().await.unwrap();
        let mut m = uow.get_or_create_maintenance(fx.pac.id).await.unwrap();
        assert!(!m.is_paused);
        m.is_paused = true;
        m.paused_by_username = "ops".to_string();
        uow.save_maintenance(&m).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let again = uow.get_or_create_maintenance(fx.pac.id).await.unwrap();
        assert_eq!(again.id, m.id);
        assert!(again.is_paused);
        assert_eq!(again.paused_by_username, "ops");
    }

    #[tokio::test]
    async fn test_due_schedules() {
        let store = test_store().await;
        let fx = seed(&store).await;
        let now = Utc::now();

        let mut uow = store.begin().await.unwrap();
        let due = uow
            .insert_schedule(&NewSchedule {
                pac_id: fx.pac.id,
                dyna_flow_type_id: fx.flow_type.id,
                frequency_in_hours: 24,
                next_utc_date_time: Some(now - chrono::Duration::minutes(1)),
            })
            .await
            .unwrap();
        uow.insert_schedule(&NewSchedule {
            pac_id: fx.pac.id,
            dyna_flow_type_id: fx.flow_type.id,
            frequency_in_hours: 24,
            next_utc_date_time: Some(now + chrono::Duration::hours(1)),
        })
        .await
        .unwrap();

        let found = uow.get_due_schedules(fx.pac.id, now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dynaflow.db");

        let store = SqliteTaskStore::from_path(&path).await.unwrap();
        let fx = seed(&store).await;
        assert!(path.exists());
        assert_eq!(fx.pac.code, "default");
    }
}
